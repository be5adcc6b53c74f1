//! Typed identifiers.
//!
//! Entities refer to each other by id, never by pointer; the runtime's
//! registry owns the lookup tables. Ids are cheap to clone and hash and
//! are the only thing allowed to cross the event bus.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id! {
    /// Identifies a deployed application.
    AppId
}
string_id! {
    /// A named service exposed by an application (e.g. `web`).
    ServiceName
}
string_id! {
    /// An application version, typically an image tag or build id.
    VersionTag
}
string_id! {
    /// Opaque id of one running sandbox.
    HandleId
}
string_id! {
    /// Container-runtime task id, owned by the bridge.
    TaskId
}

/// The scaling unit: one pool per `(application, service)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId {
    pub app: AppId,
    pub service: ServiceName,
}

impl PoolId {
    pub fn new(app: impl Into<AppId>, service: impl Into<ServiceName>) -> Self {
        Self {
            app: app.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.service)
    }
}

/// A time-bounded reservation of a handle for a single request.
///
/// Granted from a monotonic counter by the lease ledger; never reused
/// within one process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_id_display_is_app_slash_service() {
        let id = PoolId::new("a1", "web");
        assert_eq!(id.to_string(), "a1/web");
    }

    #[test]
    fn ids_roundtrip_through_serde() {
        let id = PoolId::new("a1", "web");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(serde_json::from_str::<PoolId>(&json).unwrap(), id);
    }
}
