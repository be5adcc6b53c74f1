//! The sandbox lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of one sandbox handle.
///
/// Progression is monotone with two exceptions: a `Ready` handle may be
/// demoted to `Unhealthy` and recover, and the orderly teardown path runs
/// `Ready -> Draining -> Terminated`. `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Requested from the container bridge but not yet running.
    Pending,
    /// The task is running; waiting for the first successful probe.
    Starting,
    /// Probed healthy; the only phase in which leases may be granted.
    Ready,
    /// Failed consecutive probes; removed from the lease-eligible set
    /// while the reconciler decides between replacement and recovery.
    Unhealthy,
    /// No new leases; existing ones run to completion.
    Draining,
    /// Gone. Absorbing.
    Terminated,
    /// The task died or never became ready within its deadline.
    Failed,
}

impl Phase {
    /// Whether a handle in this phase may be granted new leases.
    #[must_use]
    pub fn leasable(self) -> bool {
        matches!(self, Phase::Ready)
    }

    /// Whether the handle still maps to a live (or pending) task.
    #[must_use]
    pub fn live(self) -> bool {
        !matches!(self, Phase::Terminated | Phase::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn may_transition(self, next: Phase) -> bool {
        use Phase::{Draining, Failed, Pending, Ready, Starting, Terminated, Unhealthy};
        match (self, next) {
            (Pending, Starting | Failed | Terminated) => true,
            (Starting, Ready | Failed | Terminated) => true,
            (Ready, Unhealthy | Draining | Terminated) => true,
            (Unhealthy, Ready | Draining | Failed | Terminated) => true,
            (Draining, Terminated | Failed) => true,
            (Failed, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Starting => "Starting",
            Phase::Ready => "Ready",
            Phase::Unhealthy => "Unhealthy",
            Phase::Draining => "Draining",
            Phase::Terminated => "Terminated",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::Phase;

    #[test]
    fn terminated_is_absorbing() {
        for next in [
            Phase::Pending,
            Phase::Starting,
            Phase::Ready,
            Phase::Unhealthy,
            Phase::Draining,
            Phase::Terminated,
            Phase::Failed,
        ] {
            assert!(!Phase::Terminated.may_transition(next));
        }
    }

    #[test]
    fn only_ready_is_leasable() {
        assert!(Phase::Ready.leasable());
        assert!(!Phase::Starting.leasable());
        assert!(!Phase::Draining.leasable());
        assert!(!Phase::Unhealthy.leasable());
    }

    #[test]
    fn unhealthy_may_recover() {
        assert!(Phase::Ready.may_transition(Phase::Unhealthy));
        assert!(Phase::Unhealthy.may_transition(Phase::Ready));
    }

    #[test]
    fn draining_cannot_return_to_ready() {
        assert!(!Phase::Draining.may_transition(Phase::Ready));
    }
}
