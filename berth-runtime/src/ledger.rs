//! Per-pool lease ledger.
//!
//! Tracks every outstanding lease against its handle. Ids come from a
//! monotonic counter and are never reused within a process lifetime.
//! Leases carry no payload; request metadata belongs to the caller.

use ahash::HashMap;
use berth_core::{HandleId, LeaseId};
use parking_lot::Mutex;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct LeaseEntry {
    handle: HandleId,
    acquired_at: Instant,
}

/// Outcome of a release call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// First release: the handle it was held against and how long.
    Released { handle: HandleId, held: Duration },
    /// The id was already released (or never granted). A no-op.
    AlreadyReleased,
}

#[derive(Debug, Default)]
pub struct LeaseLedger {
    next: AtomicU64,
    outstanding: Mutex<HashMap<LeaseId, LeaseEntry>>,
    double_releases: AtomicU64,
}

impl LeaseLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a lease against `handle`. The caller has already won the
    /// handle's lease slot.
    pub fn grant(&self, handle: HandleId) -> LeaseId {
        let id = LeaseId(self.next.fetch_add(1, Ordering::Relaxed));
        let entry = LeaseEntry {
            handle,
            acquired_at: Instant::now(),
        };
        self.outstanding.lock().insert(id, entry);
        id
    }

    /// Release `id`. Idempotent: a second release is a no-op, surfaced
    /// only in [`double_release_count`](Self::double_release_count).
    pub fn release(&self, id: LeaseId) -> Release {
        match self.outstanding.lock().remove(&id) {
            Some(entry) => Release::Released {
                handle: entry.handle,
                held: entry.acquired_at.elapsed(),
            },
            None => {
                self.double_releases.fetch_add(1, Ordering::Relaxed);
                Release::AlreadyReleased
            }
        }
    }

    /// Outstanding leases held against `handle`.
    #[must_use]
    pub fn count_for(&self, handle: &HandleId) -> usize {
        self.outstanding
            .lock()
            .values()
            .filter(|entry| &entry.handle == handle)
            .count()
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Age of the oldest unreleased lease; used to spot stuck requests.
    #[must_use]
    pub fn oldest_outstanding(&self) -> Option<Duration> {
        let now = Instant::now();
        self.outstanding
            .lock()
            .values()
            .map(|entry| now.saturating_duration_since(entry.acquired_at))
            .max()
    }

    /// How often a released id was released again, for diagnostics.
    #[must_use]
    pub fn double_release_count(&self) -> u64 {
        self.double_releases.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_is_monotonic() {
        let ledger = LeaseLedger::new();
        let a = ledger.grant(HandleId::new("h1"));
        let b = ledger.grant(HandleId::new("h1"));
        assert!(b > a);
    }

    #[test]
    fn release_twice_is_a_counted_noop() {
        let ledger = LeaseLedger::new();
        let id = ledger.grant(HandleId::new("h1"));
        assert!(matches!(ledger.release(id), Release::Released { .. }));
        assert_eq!(ledger.release(id), Release::AlreadyReleased);
        assert_eq!(ledger.double_release_count(), 1);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn count_for_tracks_unreleased_only() {
        let ledger = LeaseLedger::new();
        let h1 = HandleId::new("h1");
        let a = ledger.grant(h1.clone());
        let _b = ledger.grant(h1.clone());
        let _c = ledger.grant(HandleId::new("h2"));
        assert_eq!(ledger.count_for(&h1), 2);
        ledger.release(a);
        assert_eq!(ledger.count_for(&h1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn oldest_outstanding_ages_with_the_clock() {
        let ledger = LeaseLedger::new();
        ledger.grant(HandleId::new("h1"));
        tokio::time::advance(Duration::from_secs(7)).await;
        ledger.grant(HandleId::new("h1"));
        let oldest = ledger.oldest_outstanding().unwrap();
        assert!(oldest >= Duration::from_secs(7));
    }
}
