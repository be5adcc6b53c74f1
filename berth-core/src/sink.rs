//! Optional audit sink for lifecycle events.

use crate::{
    id::{HandleId, PoolId, VersionTag},
    phase::Phase,
};

/// What happened, for audit purposes. Not to be confused with the
/// runtime's internal event bus, which carries scheduling signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleKind {
    HandleCreated,
    PhaseChanged { from: Phase, to: Phase },
    VersionActivated,
    VersionPoisoned,
    WindowDeleted,
}

#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub pool: PoolId,
    pub handle: Option<HandleId>,
    pub version: Option<VersionTag>,
    pub kind: LifecycleKind,
    pub reason: String,
}

/// Receives every lifecycle transition, best effort. Implementations
/// must not block; the runtime calls this inline on its own tasks.
pub trait EventSink: Send + Sync {
    fn on_lifecycle_event(&self, event: &LifecycleEvent);
}

/// Sink that discards everything, for callers that do not audit.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_lifecycle_event(&self, _event: &LifecycleEvent) {}
}
