//! Caller-facing error taxonomy.
//!
//! The dispatcher and registry surface only these kinds; everything else
//! (bridge timeouts, probe failures, store errors) is internal, logged
//! with pool and handle identifiers and raised on the event bus.

use crate::id::{PoolId, VersionTag};
use thiserror::Error;

/// Failure modes of [`acquire_lease`](`crate`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// No pool is registered for the requested `(app, service)`.
    #[error("no pool registered for {0}")]
    UnknownPool(PoolId),

    /// No handle became ready before the caller's deadline. Capacity was
    /// not consumed; the caller may retry.
    #[error("no ready handle before deadline in pool {0}")]
    Timeout(PoolId),

    /// The active version is poisoned and blocked from launching.
    #[error("version {1} of pool {0} is poisoned")]
    Poisoned(PoolId, VersionTag),

    /// The runtime is in its shutdown phase and grants no new leases.
    #[error("runtime is shutting down")]
    ShuttingDown,
}

/// Synchronous rejections of configuration calls. No state changes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no pool registered for {0}")]
    UnknownPool(PoolId),

    /// `min <= max` violated, or a bound exceeds the pool's hard cap.
    #[error("invalid scale bounds: min={min} max={max}")]
    InvalidBounds { min: u32, max: u32 },

    /// The image reference could not be resolved by the bridge.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// The tag was poisoned by repeated failures and needs an operator
    /// reset (or a new tag) before it can be activated again.
    #[error("version {1} of pool {0} is poisoned")]
    Poisoned(PoolId, VersionTag),

    /// The pool still has live sandboxes or outstanding leases.
    #[error("pool {0} is not idle")]
    PoolBusy(PoolId),
}
