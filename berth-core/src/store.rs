//! The entity store contract: scoped transactions over attribute tuples.
//!
//! Pool, window, and handle records persist as `(entity, attribute,
//! value)` tuples under stable ids (see [`crate::record`]). One reconcile
//! pass writes one atomic batch; a failed batch aborts the pass and the
//! next pass rereads from the store, so partially-persisted state is
//! never observable.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The write batch was rejected as a whole; nothing was applied.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Entity id, stable across restarts (e.g. `pool:a1/web`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub String);

/// Attribute name within an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttrId(pub String);

/// One attribute tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    pub entity: EntityId,
    pub attr: AttrId,
    pub value: Value,
}

impl Tuple {
    pub fn new(entity: impl Into<String>, attr: impl Into<String>, value: Value) -> Self {
        Self {
            entity: EntityId(entity.into()),
            attr: AttrId(attr.into()),
            value,
        }
    }
}

/// A single mutation inside a write batch.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleOp {
    /// Upsert one attribute.
    Put(Tuple),
    /// Remove one attribute.
    Delete(EntityId, AttrId),
    /// Remove an entity and all its attributes.
    DeleteEntity(EntityId),
}

/// Storage seam used by the journal.
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    /// Apply `ops` atomically: either every op lands or none do.
    async fn transact(&self, ops: Vec<TupleOp>) -> Result<(), Error>;

    /// Snapshot every tuple whose entity id starts with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<Tuple>, Error>;
}
