//! The scaling unit: windows, waiters, intent, and version routing for
//! one `(application, service)` pair.
//!
//! The pool owns its windows and handles exclusively; every other
//! component holds ids and looks them up here. All methods take the pool
//! lock briefly and never across an await; the reconciler works against
//! snapshots and commits mutations through the narrow methods below.

use crate::{
    config::PoolSpec,
    events::{Bus, Event},
    handle::SandboxHandle,
    ledger::{LeaseLedger, Release},
    window::{VersionWindow, WindowMode},
};
use berth_core::{
    intent::{ScaleBounds, ScaleRationale},
    record::PoolRecord,
    AcquireError, ConfigError, HandleId, LeaseId, Phase, PoolId, VersionTag,
};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{sync::oneshot, time::Instant};

/// A granted lease: the handle plus the ledger id to release.
pub type Grant = (Arc<SandboxHandle>, LeaseId);

/// Either an immediate grant or a queue slot that resolves on a
/// `HandleReady` / `LeaseReleased` event.
pub enum AcquireOutcome {
    Granted(Grant),
    Wait(oneshot::Receiver<Grant>),
}

struct Waiter {
    tx: oneshot::Sender<Grant>,
}

struct PoolState {
    spec: PoolSpec,
    desired: u32,
    generation: u64,
    active: Option<VersionTag>,
    /// Image per known version tag, for relaunches while a tag is live.
    images: HashMap<VersionTag, String>,
    windows: Vec<VersionWindow>,
    waiters: VecDeque<Waiter>,
    poisoned: HashSet<VersionTag>,
    failures: HashMap<VersionTag, VecDeque<Instant>>,
    last_rationale: ScaleRationale,
    shutting_down: bool,
}

pub struct Pool {
    pub id: PoolId,
    state: Mutex<PoolState>,
    pub ledger: LeaseLedger,
    bus: Bus,
}

impl Pool {
    #[must_use]
    pub fn new(spec: PoolSpec, bus: Bus) -> Arc<Self> {
        let id = spec.id.clone();
        let desired = spec.bounds.clamp(0);
        Arc::new(Self {
            id,
            state: Mutex::new(PoolState {
                spec,
                desired,
                generation: 0,
                active: None,
                images: HashMap::new(),
                windows: Vec::new(),
                waiters: VecDeque::new(),
                poisoned: HashSet::new(),
                failures: HashMap::new(),
                last_rationale: ScaleRationale::default(),
                shutting_down: false,
            }),
            ledger: LeaseLedger::new(),
            bus,
        })
    }

    pub fn spec(&self) -> PoolSpec {
        self.state.lock().spec.clone()
    }

    pub fn desired(&self) -> u32 {
        self.state.lock().desired
    }

    pub fn active_version(&self) -> Option<VersionTag> {
        self.state.lock().active.clone()
    }

    // ---------------------------------------------------------------
    // Lease path
    // ---------------------------------------------------------------

    /// Try to grant immediately; otherwise join the FIFO waiter queue.
    ///
    /// A cold pool (`desired == 0`, nothing live) registers demand by
    /// raising desired to the scale floor or one, so the reconciler's
    /// next pass launches. Saturated-but-alive pools just wait.
    pub fn acquire_or_wait(&self) -> Result<AcquireOutcome, AcquireError> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(AcquireError::ShuttingDown);
        }
        if let Some(active) = &state.active {
            if state.poisoned.contains(active) && !Self::any_routable(&state) {
                return Err(AcquireError::Poisoned(self.id.clone(), active.clone()));
            }
        }
        if let Some(grant) = self.try_grant_locked(&mut state) {
            return Ok(AcquireOutcome::Granted(grant));
        }

        if state.desired == 0 && Self::live_supply(&state) == 0 {
            let floor = state.spec.bounds.clamp(1);
            if floor > 0 && state.desired != floor {
                state.desired = floor;
                tracing::debug!(pool = %self.id, desired = floor, "cold acquire raised desired");
                self.bus.publish(Event::ScaleIntentChanged {
                    pool: self.id.clone(),
                    desired: floor,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter { tx });
        Ok(AcquireOutcome::Wait(rx))
    }

    /// Selection across windows: the active window wins while it has any
    /// `Ready` handle (a saturated active window means the caller waits
    /// rather than spilling onto an old version); with no ready active
    /// handle, still-routable retiring windows serve, newest first.
    fn try_grant_locked(&self, state: &mut PoolState) -> Option<Grant> {
        let cap = state.spec.per_handle_concurrency;
        let active = state.active.clone();
        let active_window_has_ready = active
            .as_ref()
            .and_then(|v| state.windows.iter().find(|w| &w.version == v))
            .is_some_and(|w| w.ready_count() > 0);

        let ordered: Vec<usize> = if active_window_has_ready {
            state
                .windows
                .iter()
                .enumerate()
                .filter(|(_, w)| Some(&w.version) == active.as_ref())
                .map(|(i, _)| i)
                .collect()
        } else {
            // Newest windows are appended last; serve the most recent
            // routable one first.
            let mut order: Vec<usize> = (0..state.windows.len()).collect();
            order.reverse();
            order
        };

        for at in ordered {
            if let Some(handle) = state.windows[at].lease_one(cap) {
                let lease = self.ledger.grant(handle.id.clone());
                return Some((handle, lease));
            }
        }
        None
    }

    /// Fulfil queued waiters in FIFO order while supply lasts. Called on
    /// `HandleReady` and `LeaseReleased` events and at the end of every
    /// reconcile pass (the repair path for dropped events).
    pub fn pump_waiters(&self) {
        loop {
            let mut state = self.state.lock();
            // Waiters whose caller gave up (deadline, cancellation).
            state.waiters.retain(|w| !w.tx.is_closed());
            if state.waiters.is_empty() {
                return;
            }
            let Some((handle, lease)) = self.try_grant_locked(&mut state) else {
                return;
            };
            let waiter = state.waiters.pop_front().expect("checked non-empty");
            drop(state);
            if let Err((handle_back, _)) = waiter.tx.send((handle, lease)) {
                // Caller went away (deadline or cancellation): roll the
                // grant back so no capacity is consumed.
                handle_back.release_lease();
                self.ledger.release(lease);
            }
        }
    }

    /// Release a lease by id. Idempotent; the first release stamps usage
    /// and publishes `LeaseReleased`.
    pub fn release(&self, lease: LeaseId) {
        match self.ledger.release(lease) {
            Release::AlreadyReleased => {}
            Release::Released { handle: id, held } => {
                let found = {
                    let state = self.state.lock();
                    state.windows.iter().find_map(|w| {
                        w.get(&id).map(|h| {
                            w.add_usage(held);
                            h.clone()
                        })
                    })
                };
                if let Some(handle) = found {
                    handle.release_lease();
                    self.bus.publish(Event::LeaseReleased {
                        pool: self.id.clone(),
                        handle: handle.id.clone(),
                    });
                }
            }
        }
    }

    fn any_routable(state: &PoolState) -> bool {
        state
            .windows
            .iter()
            .any(|w| w.routable() && w.ready_count() > 0)
    }

    /// How long the whole pool has been idle: `None` while any lease is
    /// outstanding or while a window with handles has recent activity.
    /// A pool with no handles at all reports `None` too; the autoscaler
    /// treats that case by the absence of offered load alone.
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        if self.ledger.outstanding() > 0 {
            return None;
        }
        let state = self.state.lock();
        state
            .windows
            .iter()
            .filter_map(|w| w.idle_since_last_release(now))
            .min()
    }

    pub fn live_handles(&self) -> usize {
        Self::live_supply(&self.state.lock())
    }

    fn live_supply(state: &PoolState) -> usize {
        state
            .windows
            .iter()
            .map(|w| w.count_in(&[Phase::Pending, Phase::Starting, Phase::Ready, Phase::Unhealthy]))
            .sum()
    }

    // ---------------------------------------------------------------
    // Intent and configuration
    // ---------------------------------------------------------------

    /// Store a new desired count (autoscaler or operator path). The
    /// reconciler actuates; this only records and signals.
    pub fn set_desired(&self, desired: u32, rationale: ScaleRationale) {
        let mut state = self.state.lock();
        let clamped = state.spec.bounds.clamp(desired);
        state.last_rationale = rationale;
        if state.desired == clamped {
            return;
        }
        state.desired = clamped;
        drop(state);
        self.bus.publish(Event::ScaleIntentChanged {
            pool: self.id.clone(),
            desired: clamped,
        });
    }

    pub fn set_bounds(&self, bounds: ScaleBounds) -> Result<(), ConfigError> {
        if !bounds.valid() {
            return Err(ConfigError::InvalidBounds {
                min: bounds.min,
                max: bounds.max,
            });
        }
        let mut state = self.state.lock();
        state.spec.bounds = bounds;
        let clamped = bounds.clamp(state.desired);
        if clamped != state.desired {
            state.desired = clamped;
            drop(state);
            self.bus.publish(Event::ScaleIntentChanged {
                pool: self.id.clone(),
                desired: clamped,
            });
        }
        Ok(())
    }

    /// Switch the active version. The prior active window keeps serving
    /// (mode `Retiring`) until the successor has a `Ready` handle; its
    /// drain deadline is armed now.
    pub fn activate_version(&self, tag: VersionTag, image: String) -> Result<(), ConfigError> {
        let mut state = self.state.lock();
        if state.poisoned.contains(&tag) {
            return Err(ConfigError::Poisoned(self.id.clone(), tag));
        }
        if state.active.as_ref() == Some(&tag) {
            state.images.insert(tag, image);
            return Ok(());
        }

        let deadline = Instant::now() + state.spec.drain_grace;
        if let Some(prior) = state.active.clone() {
            if let Some(window) = state.windows.iter_mut().find(|w| w.version == prior) {
                window.mode = WindowMode::Retiring { deadline };
            }
        }
        state.images.insert(tag.clone(), image);
        state.active = Some(tag.clone());
        state.generation += 1;
        if !state.windows.iter().any(|w| w.version == tag) {
            let mut window = VersionWindow::new(self.id.clone(), tag.clone());
            window.mode = WindowMode::Active;
            state.windows.push(window);
        } else if let Some(window) = state.windows.iter_mut().find(|w| w.version == tag) {
            window.mode = WindowMode::Active;
        }
        drop(state);
        self.bus.publish(Event::VersionActivated {
            pool: self.id.clone(),
            version: tag,
        });
        Ok(())
    }

    pub fn image_for(&self, version: &VersionTag) -> Option<String> {
        self.state.lock().images.get(version).cloned()
    }

    // ---------------------------------------------------------------
    // Poison tracking
    // ---------------------------------------------------------------

    /// Record one `Failed` transition (or failed launch) for `version`.
    /// Returns `true` when this failure tips the version into
    /// `Poisoned`: `threshold` failures within `window`. Poison blocks
    /// further launches of the tag until an operator resets it.
    pub fn record_version_failure(
        &self,
        version: &VersionTag,
        window: Duration,
        threshold: u32,
    ) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.poisoned.contains(version) {
            return false;
        }
        let failures = state.failures.entry(version.clone()).or_default();
        failures.push_back(now);
        while let Some(front) = failures.front() {
            if now.saturating_duration_since(*front) > window {
                failures.pop_front();
            } else {
                break;
            }
        }
        if failures.len() as u32 >= threshold {
            state.poisoned.insert(version.clone());
            tracing::warn!(pool = %self.id, %version, "version poisoned after repeated failures");
            return true;
        }
        false
    }

    pub fn is_poisoned(&self, version: &VersionTag) -> bool {
        self.state.lock().poisoned.contains(version)
    }

    /// Operator-only escape hatch; poison never clears on its own.
    pub fn reset_poison(&self, version: &VersionTag) -> bool {
        let mut state = self.state.lock();
        state.failures.remove(version);
        state.poisoned.remove(version)
    }

    // ---------------------------------------------------------------
    // Reconciler surface
    // ---------------------------------------------------------------

    /// Immutable view for one reconcile pass.
    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock();
        PoolSnapshot {
            id: self.id.clone(),
            spec: state.spec.clone(),
            desired: state.desired,
            generation: state.generation,
            active: state.active.clone(),
            poisoned: state.poisoned.iter().cloned().collect(),
            windows: state
                .windows
                .iter()
                .map(|w| WindowSnapshot {
                    version: w.version.clone(),
                    mode: w.mode,
                    usage_usec: w.usage_usec(),
                    handles: w.handles().to_vec(),
                })
                .collect(),
        }
    }

    /// Attach a freshly launched handle to its version window. Fails if
    /// the window disappeared while the launch was in flight; the caller
    /// then owns the orphan task and must reap it.
    pub fn admit_handle(&self, handle: Arc<SandboxHandle>) -> Result<(), Arc<SandboxHandle>> {
        let mut state = self.state.lock();
        match state
            .windows
            .iter_mut()
            .find(|w| w.version == handle.version)
        {
            Some(window) => {
                window.insert(handle);
                Ok(())
            }
            None => Err(handle),
        }
    }

    /// Flip a retiring window to draining once its successor serves, or
    /// on deadline. Drains every handle in it.
    pub fn begin_window_drain(&self, version: &VersionTag, deadline: Instant) {
        let mut state = self.state.lock();
        if let Some(window) = state.windows.iter_mut().find(|w| &w.version == version) {
            window.mode = WindowMode::Draining { deadline };
            for handle in window.handles() {
                if handle.phase().may_transition(Phase::Draining) {
                    let _ = handle.begin_drain();
                }
            }
        }
    }

    /// Drop a terminated handle from its window.
    pub fn evict_handle(&self, version: &VersionTag, id: &HandleId) {
        let mut state = self.state.lock();
        if let Some(window) = state.windows.iter_mut().find(|w| &w.version == version) {
            window.remove(id);
        }
    }

    /// Delete `version`'s window if it is collectible. Returns whether a
    /// window was removed.
    pub fn collect_window(&self, version: &VersionTag) -> bool {
        let mut state = self.state.lock();
        if state.active.as_ref() == Some(version) {
            return false;
        }
        let Some(at) = state.windows.iter().position(|w| &w.version == version) else {
            return false;
        };
        if !state.windows[at].collectible() {
            return false;
        }
        state.windows.remove(at);
        state.images.remove(version);
        true
    }

    /// Restore journaled pool state without publishing events; used by
    /// the registry's restart path before the loops are running.
    pub fn adopt_record(&self, record: &PoolRecord) {
        let mut state = self.state.lock();
        state.spec.bounds = record.bounds;
        state.spec.idle_eviction = Duration::from_secs(record.idle_eviction_secs);
        state.spec.health_grace = Duration::from_secs(record.health_grace_secs);
        state.desired = record.bounds.clamp(record.desired);
        state.generation = record.generation;
        state.poisoned.extend(record.poisoned.iter().cloned());
        if let (Some(tag), Some(image)) = (&record.active_version, &record.image) {
            state.images.insert(tag.clone(), image.clone());
            state.active = Some(tag.clone());
            if !state.windows.iter().any(|w| &w.version == tag) {
                state
                    .windows
                    .push(VersionWindow::new(self.id.clone(), tag.clone()));
            }
        }
    }

    /// Recreate a journaled window in the given mode, for restart.
    pub fn adopt_window(&self, version: &VersionTag, mode: WindowMode) {
        let mut state = self.state.lock();
        if let Some(window) = state.windows.iter_mut().find(|w| &w.version == version) {
            window.mode = mode;
            return;
        }
        let mut window = VersionWindow::new(self.id.clone(), version.clone());
        window.mode = mode;
        state.windows.push(window);
    }

    /// Stop granting leases and wake queued callers with nothing; used
    /// by the runtime's shutdown phase. In-flight leases run on.
    pub fn begin_shutdown(&self) {
        let mut state = self.state.lock();
        state.shutting_down = true;
        state.waiters.clear();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    pub fn status(&self) -> PoolStatus {
        let now = Instant::now();
        let state = self.state.lock();
        let windows = state
            .windows
            .iter()
            .map(|w| WindowStatus {
                version: w.version.clone(),
                mode: match w.mode {
                    WindowMode::Active => "active",
                    WindowMode::Retiring { .. } => "retiring",
                    WindowMode::Draining { .. } => "draining",
                },
                usage_usec: w.usage_usec(),
                idle: w.idle_since_last_release(now),
                handles: w
                    .handles()
                    .iter()
                    .map(|h| HandleStatus {
                        id: h.id.clone(),
                        phase: h.phase(),
                        leases: h.lease_count(),
                        endpoint: h.endpoint.to_string(),
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();
        PoolStatus {
            id: self.id.clone(),
            desired: state.desired,
            bounds: state.spec.bounds,
            generation: state.generation,
            active_version: state.active.clone(),
            ready: windows
                .iter()
                .flat_map(|w| &w.handles)
                .filter(|h| h.phase == Phase::Ready)
                .count(),
            leases: self.ledger.outstanding(),
            oldest_lease: self.ledger.oldest_outstanding(),
            double_releases: self.ledger.double_release_count(),
            poisoned: state.poisoned.iter().cloned().collect(),
            waiters: state.waiters.len(),
            rationale: state.last_rationale,
            windows,
        }
    }

    pub fn to_record(&self) -> PoolRecord {
        let state = self.state.lock();
        PoolRecord {
            id: self.id.clone(),
            bounds: state.spec.bounds,
            desired: state.desired,
            active_version: state.active.clone(),
            image: state
                .active
                .as_ref()
                .and_then(|v| state.images.get(v).cloned()),
            generation: state.generation,
            idle_eviction_secs: state.spec.idle_eviction.as_secs(),
            health_grace_secs: state.spec.health_grace.as_secs(),
            poisoned: state.poisoned.iter().cloned().collect(),
        }
    }
}

/// Reconciler's working copy of one pool.
#[derive(Clone)]
pub struct PoolSnapshot {
    pub id: PoolId,
    pub spec: PoolSpec,
    pub desired: u32,
    pub generation: u64,
    pub active: Option<VersionTag>,
    pub poisoned: Vec<VersionTag>,
    pub windows: Vec<WindowSnapshot>,
}

#[derive(Clone)]
pub struct WindowSnapshot {
    pub version: VersionTag,
    pub mode: WindowMode,
    pub usage_usec: u64,
    pub handles: Vec<Arc<SandboxHandle>>,
}

impl PoolSnapshot {
    pub fn window(&self, version: &VersionTag) -> Option<&WindowSnapshot> {
        self.windows.iter().find(|w| &w.version == version)
    }
}

/// `DescribePool` output.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub id: PoolId,
    pub desired: u32,
    pub bounds: ScaleBounds,
    pub generation: u64,
    pub active_version: Option<VersionTag>,
    pub ready: usize,
    pub leases: usize,
    pub oldest_lease: Option<Duration>,
    pub double_releases: u64,
    pub poisoned: Vec<VersionTag>,
    pub waiters: usize,
    pub rationale: ScaleRationale,
    pub windows: Vec<WindowStatus>,
}

#[derive(Debug, Clone)]
pub struct WindowStatus {
    pub version: VersionTag,
    pub mode: &'static str,
    pub usage_usec: u64,
    pub idle: Option<Duration>,
    pub handles: Vec<HandleStatus>,
}

#[derive(Debug, Clone)]
pub struct HandleStatus {
    pub id: HandleId,
    pub phase: Phase,
    pub leases: u32,
    pub endpoint: String,
}
