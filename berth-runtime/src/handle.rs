//! One running sandbox and its lifecycle bookkeeping.

use berth_core::{
    bridge::Endpoint, record::HandleRecord, HandleId, Phase, PoolId, TaskId, VersionTag,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// `terminate` was called while leases are outstanding.
    #[error("handle {0} still holds {1} leases")]
    BusyDraining(HandleId, u32),

    /// The requested phase change is not legal from the current phase.
    #[error("handle {handle}: illegal transition {from} -> {to}")]
    IllegalTransition {
        handle: HandleId,
        from: Phase,
        to: Phase,
    },
}

/// Mutable portion, guarded by one mutex so every transition is atomic
/// with respect to concurrent leasing. Locked last in the
/// pool -> window -> handle order and never across an await.
#[derive(Debug)]
struct HandleState {
    phase: Phase,
    leases: u32,
    consecutive_fails: u32,
    last_became_ready: Option<Instant>,
    /// Set whenever the lease count returns to zero; `None` while leased.
    last_idle: Option<Instant>,
    unhealthy_since: Option<Instant>,
}

/// A running sandbox instance that can service requests.
#[derive(Debug)]
pub struct SandboxHandle {
    pub id: HandleId,
    pub pool: PoolId,
    pub version: VersionTag,
    pub task: TaskId,
    pub endpoint: Endpoint,
    pub created: Instant,
    created_unix_ms: u64,
    state: Mutex<HandleState>,
}

/// Result of applying one probe observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthObservation {
    pub phase_before: Phase,
    pub phase_after: Phase,
    pub consecutive_fails: u32,
}

impl HealthObservation {
    #[must_use]
    pub fn transitioned(&self) -> bool {
        self.phase_before != self.phase_after
    }
}

impl SandboxHandle {
    #[must_use]
    pub fn new(
        id: HandleId,
        pool: PoolId,
        version: VersionTag,
        task: TaskId,
        endpoint: Endpoint,
        created_unix_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            pool,
            version,
            task,
            endpoint,
            created: Instant::now(),
            created_unix_ms,
            state: Mutex::new(HandleState {
                phase: Phase::Starting,
                leases: 0,
                consecutive_fails: 0,
                last_became_ready: None,
                last_idle: None,
                unhealthy_since: None,
            }),
        })
    }

    /// Rebuild a handle from its journal record. It re-enters the world
    /// as `Unhealthy` so the monitor re-proves liveness before any lease.
    #[must_use]
    pub fn adopt(record: &HandleRecord) -> Arc<Self> {
        let handle = Self::new(
            record.id.clone(),
            record.pool.clone(),
            record.version.clone(),
            record.task.clone(),
            record.endpoint.clone(),
            record.created_unix_ms,
        );
        {
            let mut state = handle.state.lock();
            state.phase = match record.phase {
                Phase::Terminated | Phase::Failed => record.phase,
                _ => Phase::Unhealthy,
            };
            if state.phase == Phase::Unhealthy {
                state.unhealthy_since = Some(Instant::now());
            }
        }
        handle
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    #[must_use]
    pub fn lease_count(&self) -> u32 {
        self.state.lock().leases
    }

    #[must_use]
    pub fn last_became_ready(&self) -> Option<Instant> {
        self.state.lock().last_became_ready
    }

    /// When the handle last became idle; `None` while leased.
    #[must_use]
    pub fn last_idle(&self) -> Option<Instant> {
        self.state.lock().last_idle
    }

    /// Snapshot `(phase, leases, last_idle)` under one lock acquisition.
    #[must_use]
    pub fn usage(&self) -> (Phase, u32, Option<Instant>) {
        let state = self.state.lock();
        (state.phase, state.leases, state.last_idle)
    }

    /// Atomically grant a lease slot if the handle is `Ready` and below
    /// `cap`. The ledger mints the lease id; this only guards the count.
    #[must_use]
    pub fn attempt_lease(&self, cap: u32) -> bool {
        let mut state = self.state.lock();
        if !state.phase.leasable() || state.leases >= cap {
            return false;
        }
        state.leases += 1;
        state.last_idle = None;
        true
    }

    /// Give back one lease slot; stamps the idle clock when the count
    /// reaches zero. Returns the remaining count.
    pub fn release_lease(&self) -> u32 {
        let mut state = self.state.lock();
        debug_assert!(state.leases > 0, "release without matching lease");
        state.leases = state.leases.saturating_sub(1);
        if state.leases == 0 {
            state.last_idle = Some(Instant::now());
        }
        state.leases
    }

    /// Apply one probe result.
    ///
    /// A success resets the fail counter, promotes `Starting` to `Ready`,
    /// and recovers an `Unhealthy` handle; a `Ready` handle that had
    /// failed fewer than `fail_threshold` times just resets and stays
    /// `Ready`, with no transition reported. A failure increments the
    /// counter and demotes `Ready` to `Unhealthy` at the threshold.
    pub fn observe_health(&self, healthy: bool, fail_threshold: u32) -> HealthObservation {
        let mut state = self.state.lock();
        let before = state.phase;
        if healthy {
            state.consecutive_fails = 0;
            if matches!(before, Phase::Starting | Phase::Unhealthy) {
                state.phase = Phase::Ready;
                state.unhealthy_since = None;
                let now = Instant::now();
                state.last_became_ready = Some(now);
                if state.leases == 0 {
                    state.last_idle = Some(now);
                }
            }
        } else {
            state.consecutive_fails += 1;
            if before == Phase::Ready && state.consecutive_fails >= fail_threshold {
                state.phase = Phase::Unhealthy;
                state.unhealthy_since = Some(Instant::now());
            }
        }
        HealthObservation {
            phase_before: before,
            phase_after: state.phase,
            consecutive_fails: state.consecutive_fails,
        }
    }

    /// Stop granting leases; existing ones run on. Returns the number of
    /// leases still outstanding. Idempotent on an already-draining handle.
    pub fn begin_drain(&self) -> Result<u32, HandleError> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Draining => Ok(state.leases),
            from if from.may_transition(Phase::Draining) => {
                state.phase = Phase::Draining;
                Ok(state.leases)
            }
            from => Err(HandleError::IllegalTransition {
                handle: self.id.clone(),
                from,
                to: Phase::Draining,
            }),
        }
    }

    /// Final transition. Refused while leases are outstanding.
    pub fn terminate(&self) -> Result<(), HandleError> {
        let mut state = self.state.lock();
        if state.leases > 0 {
            return Err(HandleError::BusyDraining(self.id.clone(), state.leases));
        }
        if state.phase == Phase::Terminated {
            return Ok(());
        }
        if !state.phase.may_transition(Phase::Terminated) {
            return Err(HandleError::IllegalTransition {
                handle: self.id.clone(),
                from: state.phase,
                to: Phase::Terminated,
            });
        }
        state.phase = Phase::Terminated;
        Ok(())
    }

    /// Mark the handle dead (task exit, start deadline blown). Unlike
    /// `terminate` this is valid with leases outstanding; in-flight
    /// requests will surface their own transport errors.
    pub fn mark_failed(&self) -> Result<(), HandleError> {
        let mut state = self.state.lock();
        if state.phase == Phase::Failed {
            return Ok(());
        }
        if !state.phase.may_transition(Phase::Failed) {
            return Err(HandleError::IllegalTransition {
                handle: self.id.clone(),
                from: state.phase,
                to: Phase::Failed,
            });
        }
        state.phase = Phase::Failed;
        Ok(())
    }

    /// How long the handle has been `Unhealthy`, if it is.
    #[must_use]
    pub fn unhealthy_for(&self, now: Instant) -> Option<std::time::Duration> {
        self.state
            .lock()
            .unhealthy_since
            .map(|since| now.saturating_duration_since(since))
    }

    /// How long the handle has been idle at `now`, if it is idle.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Option<std::time::Duration> {
        let state = self.state.lock();
        match (state.leases, state.last_idle) {
            (0, Some(since)) => Some(now.saturating_duration_since(since)),
            _ => None,
        }
    }

    /// Journal record for the current state.
    #[must_use]
    pub fn to_record(&self) -> HandleRecord {
        HandleRecord {
            id: self.id.clone(),
            pool: self.pool.clone(),
            version: self.version.clone(),
            task: self.task.clone(),
            endpoint: self.endpoint.clone(),
            phase: self.phase(),
            created_unix_ms: self.created_unix_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> Arc<SandboxHandle> {
        SandboxHandle::new(
            HandleId::new("h1"),
            PoolId::new("a1", "web"),
            VersionTag::new("v1"),
            TaskId::new("t1"),
            Endpoint {
                host: "127.0.0.1".into(),
                port: 8080,
            },
            0,
        )
    }

    fn ready_handle() -> Arc<SandboxHandle> {
        let h = handle();
        h.observe_health(true, 3);
        h
    }

    #[test]
    fn starting_handles_refuse_leases() {
        let h = handle();
        assert!(!h.attempt_lease(8));
        assert_eq!(h.lease_count(), 0);
    }

    #[test]
    fn first_successful_probe_promotes_to_ready() {
        let h = handle();
        let obs = h.observe_health(true, 3);
        assert_eq!(obs.phase_before, Phase::Starting);
        assert_eq!(obs.phase_after, Phase::Ready);
        assert!(h.attempt_lease(8));
    }

    #[test]
    fn lease_cap_is_a_hard_limit() {
        let h = ready_handle();
        assert!(h.attempt_lease(2));
        assert!(h.attempt_lease(2));
        assert!(!h.attempt_lease(2));
        assert_eq!(h.lease_count(), 2);
    }

    #[test]
    fn release_to_zero_stamps_idle_clock() {
        let h = ready_handle();
        assert!(h.attempt_lease(8));
        assert!(h.last_idle().is_none());
        assert_eq!(h.release_lease(), 0);
        assert!(h.last_idle().is_some());
    }

    #[test]
    fn two_failures_then_success_stays_ready_with_reset_counter() {
        let h = ready_handle();
        h.observe_health(false, 3);
        let second = h.observe_health(false, 3);
        assert_eq!(second.phase_after, Phase::Ready);
        assert_eq!(second.consecutive_fails, 2);
        let third = h.observe_health(true, 3);
        assert!(!third.transitioned());
        assert_eq!(third.consecutive_fails, 0);
    }

    #[test]
    fn threshold_failures_demote_to_unhealthy_and_probe_recovers() {
        let h = ready_handle();
        for _ in 0..3 {
            h.observe_health(false, 3);
        }
        assert_eq!(h.phase(), Phase::Unhealthy);
        assert!(!h.attempt_lease(8));
        let obs = h.observe_health(true, 3);
        assert_eq!(obs.phase_after, Phase::Ready);
    }

    #[test]
    fn draining_refuses_new_leases_but_keeps_existing() {
        let h = ready_handle();
        assert!(h.attempt_lease(8));
        assert_eq!(h.begin_drain().unwrap(), 1);
        assert!(!h.attempt_lease(8));
        assert_eq!(h.terminate(), Err(HandleError::BusyDraining(h.id.clone(), 1)));
        h.release_lease();
        assert_eq!(h.terminate(), Ok(()));
        assert_eq!(h.phase(), Phase::Terminated);
    }

    #[test]
    fn terminate_is_idempotent() {
        let h = ready_handle();
        h.terminate().unwrap();
        h.terminate().unwrap();
    }

    #[test]
    fn adopted_handles_come_back_unhealthy() {
        let h = ready_handle();
        let adopted = SandboxHandle::adopt(&h.to_record());
        assert_eq!(adopted.phase(), Phase::Unhealthy);
    }
}
