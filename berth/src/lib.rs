//! Facade over the berth sandbox scheduler.
//!
//! Re-exports the data model ([`core`]) and the runtime ([`runtime`])
//! under one roof, which is how binaries (ingress, CLI) consume the
//! subsystem:
//!
//! ```no_run
//! use berth::prelude::*;
//! use std::{sync::Arc, time::Duration};
//!
//! # async fn example(
//! #     bridge: Arc<dyn berth::core::bridge::ContainerBridge>,
//! #     store: Arc<dyn berth::core::store::EntityStore>,
//! #     metrics: Arc<dyn berth::core::metrics::MetricsReader>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::builder(bridge, store, metrics).start().await?;
//! registry
//!     .create_pool(PoolSpec::new(PoolId::new("a1", "web")).with_bounds(0, 4))
//!     .await?;
//! registry.activate_version(&PoolId::new("a1", "web"), VersionTag::new("v1"), "registry/app:v1")?;
//!
//! let lease = registry
//!     .acquire_lease("a1", "web", Duration::from_secs(30))
//!     .await?;
//! // proxy the request to lease.endpoint() ...
//! lease.release();
//! # Ok(())
//! # }
//! ```

pub use berth_core as core;
pub use berth_runtime as runtime;

pub use berth_core::{
    AcquireError, AppId, ConfigError, HandleId, LeaseId, Phase, PoolId, ServiceName, VersionTag,
};
pub use berth_runtime::{Builder, Lease, PoolSpec, Registry, RuntimeConfig};

/// The names most callers need.
pub mod prelude {
    pub use berth_core::{AcquireError, ConfigError, Phase, PoolId, VersionTag};
    pub use berth_runtime::{Lease, PoolSpec, Registry, RuntimeConfig};
}
