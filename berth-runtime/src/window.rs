//! A version window: the handles of one version inside one pool.

use crate::handle::SandboxHandle;
use berth_core::{record::WindowState, HandleId, Phase, PoolId, VersionTag};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;

/// Routing state of a window within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    /// The active version; new leases land here first.
    Active,
    /// Superseded, but still routable until the successor has a `Ready`
    /// handle. The deadline was armed at activation time.
    Retiring { deadline: Instant },
    /// Refusing new leases; handles drain and terminate.
    Draining { deadline: Instant },
}

impl WindowMode {
    /// The persisted form. Retiring windows journal as draining so a
    /// restarted reconciler resumes the countdown either way.
    #[must_use]
    pub fn to_state(self, now: Instant, now_unix_ms: u64) -> WindowState {
        match self {
            WindowMode::Active => WindowState::Active,
            WindowMode::Retiring { deadline } | WindowMode::Draining { deadline } => {
                let left = deadline.saturating_duration_since(now).as_millis() as u64;
                WindowState::Draining {
                    deadline_unix_ms: now_unix_ms + left,
                }
            }
        }
    }
}

/// Ordered set of same-version handles with lease and idle accounting.
#[derive(Debug)]
pub struct VersionWindow {
    pub pool: PoolId,
    pub version: VersionTag,
    pub mode: WindowMode,
    handles: Vec<Arc<SandboxHandle>>,
    /// Monotonic microseconds of leased wall time, for reporting.
    usage_usec: AtomicU64,
}

impl VersionWindow {
    #[must_use]
    pub fn new(pool: PoolId, version: VersionTag) -> Self {
        Self {
            pool,
            version,
            mode: WindowMode::Active,
            handles: Vec::new(),
            usage_usec: AtomicU64::new(0),
        }
    }

    pub fn insert(&mut self, handle: Arc<SandboxHandle>) {
        debug_assert_eq!(handle.version, self.version);
        self.handles.push(handle);
    }

    pub fn remove(&mut self, id: &HandleId) -> Option<Arc<SandboxHandle>> {
        let at = self.handles.iter().position(|h| &h.id == id)?;
        Some(self.handles.remove(at))
    }

    #[must_use]
    pub fn get(&self, id: &HandleId) -> Option<&Arc<SandboxHandle>> {
        self.handles.iter().find(|h| &h.id == id)
    }

    #[must_use]
    pub fn handles(&self) -> &[Arc<SandboxHandle>] {
        &self.handles
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Whether this window may currently be offered new leases.
    #[must_use]
    pub fn routable(&self) -> bool {
        !matches!(self.mode, WindowMode::Draining { .. })
    }

    /// Grant one lease slot using the placement policy: among `Ready`
    /// handles below `cap`, prefer the fewest active leases and break
    /// ties by oldest `last_became_ready`, so caches warm evenly.
    ///
    /// The select-then-acquire pair races with concurrent transitions,
    /// so losing a slot retries the remaining candidates.
    #[must_use]
    pub fn lease_one(&self, cap: u32) -> Option<Arc<SandboxHandle>> {
        if !self.routable() {
            return None;
        }
        let mut candidates: Vec<_> = self
            .handles
            .iter()
            .filter_map(|h| {
                let (phase, leases, _) = h.usage();
                (phase == Phase::Ready && leases < cap).then_some((leases, h))
            })
            .collect();
        candidates.sort_by_key(|(leases, h)| (*leases, h.last_became_ready()));
        for (_, candidate) in candidates {
            if candidate.attempt_lease(cap) {
                return Some(candidate.clone());
            }
        }
        None
    }

    /// Whether any handle could take a lease right now, at or below cap.
    #[must_use]
    pub fn has_capacity(&self, cap: u32) -> bool {
        self.routable()
            && self.handles.iter().any(|h| {
                let (phase, leases, _) = h.usage();
                phase == Phase::Ready && leases < cap
            })
    }

    #[must_use]
    pub fn count_in(&self, phases: &[Phase]) -> usize {
        self.handles
            .iter()
            .filter(|h| phases.contains(&h.phase()))
            .count()
    }

    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.count_in(&[Phase::Ready])
    }

    /// Outstanding leases across the window.
    #[must_use]
    pub fn lease_count(&self) -> u32 {
        self.handles.iter().map(|h| h.lease_count()).sum()
    }

    /// Sum of the idle durations of currently-idle handles, read by the
    /// autoscaler when it evaluates scale-to-zero.
    #[must_use]
    pub fn idle_duration(&self, now: Instant) -> Duration {
        self.handles
            .iter()
            .filter_map(|h| h.idle_for(now))
            .sum()
    }

    /// Shortest idle age across idle handles, `None` while any lease is
    /// outstanding or the window is empty.
    #[must_use]
    pub fn idle_since_last_release(&self, now: Instant) -> Option<Duration> {
        if self.lease_count() > 0 || self.handles.is_empty() {
            return None;
        }
        self.handles.iter().filter_map(|h| h.idle_for(now)).min()
    }

    pub fn add_usage(&self, held: Duration) {
        self.usage_usec
            .fetch_add(held.as_micros() as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn usage_usec(&self) -> u64 {
        self.usage_usec.load(Ordering::Relaxed)
    }

    /// Collectible once nothing lives here and nothing is leased.
    #[must_use]
    pub fn collectible(&self) -> bool {
        self.lease_count() == 0 && self.handles.iter().all(|h| !h.phase().live())
    }
}
