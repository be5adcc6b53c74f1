//! The container runtime bridge contract.
//!
//! The bridge is an external process; calls carry their own timeouts and
//! are not protected by any runtime lock. The runtime depends only on the
//! minimal operations here and tests substitute an in-memory fake.

use crate::id::TaskId;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The call did not complete within its own timeout.
    #[error("bridge call timed out after {0:?}")]
    Timeout(Duration),

    /// The image reference could not be resolved or pulled.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// The task is gone (already reaped, or never existed).
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// Anything else the bridge reports; retried with backoff by callers.
    #[error("bridge failure: {0}")]
    Unavailable(String),
}

/// What to launch. Synthesised by the reconciler from the pool's active
/// version and resource limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub image: String,
    pub env: Vec<(String, String)>,
    pub cpu_limit_millis: u32,
    pub mem_limit_bytes: u64,
}

/// Network address a sandbox serves on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A successfully started task.
#[derive(Debug, Clone)]
pub struct Launched {
    pub task: TaskId,
    pub endpoint: Endpoint,
}

/// Point-in-time cgroup readings for one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub cpu_usec: u64,
    pub rss_bytes: u64,
}

/// Minimal surface of the container runtime.
///
/// `launch` may take seconds (image pull); callers bound it with their
/// own deadline and honour cancellation at the await point.
#[async_trait::async_trait]
pub trait ContainerBridge: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Launched, Error>;

    /// Signal the task and wait up to `grace` for exit, returning the
    /// exit code. A second kill of a reaped task returns `UnknownTask`.
    async fn kill(&self, task: &TaskId, signal: i32, grace: Duration) -> Result<i32, Error>;

    async fn stats(&self, task: &TaskId) -> Result<TaskStats, Error>;
}
