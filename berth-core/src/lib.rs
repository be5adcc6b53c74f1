//! Core types for the berth sandbox scheduler.
//!
//! This crate holds the data model shared between the runtime and its
//! callers: typed identifiers, the sandbox phase machine, persisted
//! records, scaling intent, and the capability traits for the external
//! collaborators (container bridge, entity store, metrics reader, event
//! sink). It contains no async machinery of its own beyond the trait
//! definitions.

pub mod bridge;
pub mod error;
pub mod id;
pub mod intent;
pub mod metrics;
pub mod phase;
pub mod record;
pub mod sink;
pub mod store;

pub use error::{AcquireError, ConfigError};
pub use id::{AppId, HandleId, LeaseId, PoolId, ServiceName, TaskId, VersionTag};
pub use intent::{ScaleBounds, ScaleIntent, ScaleRationale};
pub use phase::Phase;
