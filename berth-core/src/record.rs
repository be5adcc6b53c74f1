//! Persisted records for pools, windows, and handles.
//!
//! Each record flattens to one attribute tuple per field plus a `domain`
//! tag, so forward-compatible additions (new fields with serde defaults)
//! do not break older loaders. Entity ids are stable across restarts.

use crate::{
    bridge::Endpoint,
    id::{HandleId, PoolId, TaskId, VersionTag},
    intent::ScaleBounds,
    phase::Phase,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::store::{AttrId, EntityId, Tuple};

/// Schema tag stamped on every entity this crate writes.
pub const DOMAIN: &str = "berth/v1";

const DOMAIN_ATTR: &str = "domain";

/// Authoritative pool configuration and intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub id: PoolId,
    pub bounds: ScaleBounds,
    pub desired: u32,
    pub active_version: Option<VersionTag>,
    pub image: Option<String>,
    /// Rolling-update generation, bumped on each activation.
    pub generation: u64,
    #[serde(default)]
    pub idle_eviction_secs: u64,
    #[serde(default)]
    pub health_grace_secs: u64,
    /// Versions blocked from launching until an operator reset.
    #[serde(default)]
    pub poisoned: Vec<VersionTag>,
}

/// Window lifecycle as persisted. `Draining` carries its deadline so a
/// restarted reconciler can resume the countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum WindowState {
    Active,
    Draining { deadline_unix_ms: u64 },
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRecord {
    pub pool: PoolId,
    pub version: VersionTag,
    pub window_state: WindowState,
    /// Monotonic microseconds of wall time leased, for reporting.
    #[serde(default)]
    pub usage_usec: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleRecord {
    pub id: HandleId,
    pub pool: PoolId,
    pub version: VersionTag,
    pub task: TaskId,
    pub endpoint: Endpoint,
    pub phase: Phase,
    pub created_unix_ms: u64,
}

/// Typed view over every record reachable from one `scan`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecordSet {
    pub pools: Vec<PoolRecord>,
    pub windows: Vec<WindowRecord>,
    pub handles: Vec<HandleRecord>,
}

pub trait Record: Serialize + DeserializeOwned {
    const PREFIX: &'static str;

    fn entity_key(&self) -> String;

    fn entity_id(&self) -> EntityId {
        EntityId(format!("{}:{}", Self::PREFIX, self.entity_key()))
    }

    /// Flatten to tuples: one per top-level field plus the domain tag.
    fn to_tuples(&self) -> Vec<Tuple> {
        let entity = self.entity_id();
        let Value::Object(fields) = serde_json::to_value(self).expect("record serializes") else {
            unreachable!("records are structs");
        };
        let mut tuples = vec![Tuple {
            entity: entity.clone(),
            attr: AttrId(DOMAIN_ATTR.into()),
            value: Value::String(DOMAIN.into()),
        }];
        tuples.extend(fields.into_iter().map(|(attr, value)| Tuple {
            entity: entity.clone(),
            attr: AttrId(attr),
            value,
        }));
        tuples
    }
}

impl Record for PoolRecord {
    const PREFIX: &'static str = "pool";

    fn entity_key(&self) -> String {
        self.id.to_string()
    }
}

impl Record for WindowRecord {
    const PREFIX: &'static str = "window";

    fn entity_key(&self) -> String {
        format!("{}@{}", self.pool, self.version)
    }
}

impl Record for HandleRecord {
    const PREFIX: &'static str = "handle";

    fn entity_key(&self) -> String {
        self.id.to_string()
    }
}

impl RecordSet {
    /// Regroup a tuple snapshot into typed records.
    ///
    /// Entities with a missing or foreign `domain` tag are skipped, as
    /// are entities that no longer deserialize (a newer writer may have
    /// removed fields this loader requires).
    #[must_use]
    pub fn from_tuples(tuples: &[Tuple]) -> Self {
        let mut by_entity: BTreeMap<&EntityId, Map<String, Value>> = BTreeMap::new();
        for tuple in tuples {
            by_entity
                .entry(&tuple.entity)
                .or_default()
                .insert(tuple.attr.0.clone(), tuple.value.clone());
        }

        let mut set = RecordSet::default();
        for (entity, mut attrs) in by_entity {
            match attrs.remove(DOMAIN_ATTR) {
                Some(Value::String(tag)) if tag == DOMAIN => {}
                _ => continue,
            }
            let value = Value::Object(attrs);
            if entity.0.starts_with("pool:") {
                if let Ok(record) = serde_json::from_value(value) {
                    set.pools.push(record);
                }
            } else if entity.0.starts_with("window:") {
                if let Ok(record) = serde_json::from_value(value) {
                    set.windows.push(record);
                }
            } else if entity.0.starts_with("handle:") {
                if let Ok(record) = serde_json::from_value(value) {
                    set.handles.push(record);
                }
            }
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_record() -> PoolRecord {
        PoolRecord {
            id: PoolId::new("a1", "web"),
            bounds: ScaleBounds { min: 0, max: 4 },
            desired: 1,
            active_version: Some(VersionTag::new("v1")),
            image: Some("registry/app:v1".into()),
            generation: 3,
            idle_eviction_secs: 300,
            health_grace_secs: 30,
            poisoned: vec![VersionTag::new("v0")],
        }
    }

    #[test]
    fn record_roundtrips_through_tuples() {
        let record = pool_record();
        let tuples = record.to_tuples();
        assert!(tuples
            .iter()
            .any(|t| t.attr.0 == "domain" && t.value == Value::String(DOMAIN.into())));

        let set = RecordSet::from_tuples(&tuples);
        assert_eq!(set.pools, vec![record]);
        assert!(set.windows.is_empty());
    }

    #[test]
    fn foreign_domain_entities_are_skipped() {
        let mut tuples = pool_record().to_tuples();
        for tuple in &mut tuples {
            if tuple.attr.0 == "domain" {
                tuple.value = Value::String("other/v9".into());
            }
        }
        assert_eq!(RecordSet::from_tuples(&tuples), RecordSet::default());
    }

    #[test]
    fn unknown_attributes_are_ignored() {
        let mut tuples = pool_record().to_tuples();
        tuples.push(Tuple::new(
            tuples[0].entity.0.clone(),
            "added_in_v2",
            Value::Bool(true),
        ));
        let set = RecordSet::from_tuples(&tuples);
        assert_eq!(set.pools.len(), 1);
    }

    #[test]
    fn draining_window_state_keeps_deadline() {
        let record = WindowRecord {
            pool: PoolId::new("a1", "web"),
            version: VersionTag::new("v1"),
            window_state: WindowState::Draining {
                deadline_unix_ms: 42_000,
            },
            usage_usec: 7,
        };
        let set = RecordSet::from_tuples(&record.to_tuples());
        assert_eq!(set.windows, vec![record]);
    }
}
