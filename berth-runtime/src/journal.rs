//! Journals pool state to the entity store.
//!
//! Every reconcile pass (and every configuration change) lands as one
//! atomic batch: upserts for the live records plus tombstones for
//! entities the pass removed. A restart scans the domain prefix back
//! into a [`RecordSet`] and the registry rebuilds the pool graph from
//! it; in-memory state is always derived.

use crate::pool::Pool;
use berth_core::{
    record::{Record, RecordSet},
    store::{EntityId, EntityStore, TupleOp},
    HandleId, PoolId, VersionTag,
};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Clone)]
pub struct Journal {
    store: Arc<dyn EntityStore>,
}

impl Journal {
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Persist `pool` and everything under it, applying `removals`
    /// (tombstones collected during the pass) in the same transaction.
    pub async fn sync_pool(
        &self,
        pool: &Pool,
        removals: Vec<TupleOp>,
    ) -> Result<(), berth_core::store::Error> {
        let now = Instant::now();
        let now_unix_ms = unix_now_ms();
        let mut ops = removals;
        ops.extend(pool.to_record().to_tuples().into_iter().map(TupleOp::Put));
        let snapshot = pool.snapshot();
        for window in &snapshot.windows {
            let record = berth_core::record::WindowRecord {
                pool: snapshot.id.clone(),
                version: window.version.clone(),
                window_state: window.mode.to_state(now, now_unix_ms),
                usage_usec: window.usage_usec,
            };
            ops.extend(record.to_tuples().into_iter().map(TupleOp::Put));
            for handle in &window.handles {
                ops.extend(handle.to_record().to_tuples().into_iter().map(TupleOp::Put));
            }
        }
        self.store.transact(ops).await
    }

    /// Remove every record belonging to `pool`.
    pub async fn remove_pool(&self, pool: &Pool) -> Result<(), berth_core::store::Error> {
        let snapshot = pool.snapshot();
        let mut ops = vec![TupleOp::DeleteEntity(EntityId(format!(
            "pool:{}",
            snapshot.id
        )))];
        for window in &snapshot.windows {
            ops.push(Self::delete_window(&snapshot.id, &window.version));
            for handle in &window.handles {
                ops.push(Self::delete_handle(&handle.id));
            }
        }
        self.store.transact(ops).await
    }

    /// Snapshot the full domain for restart rebuild.
    pub async fn load(&self) -> Result<RecordSet, berth_core::store::Error> {
        let tuples = self.store.scan("").await?;
        Ok(RecordSet::from_tuples(&tuples))
    }

    #[must_use]
    pub fn delete_handle(id: &HandleId) -> TupleOp {
        TupleOp::DeleteEntity(EntityId(format!("handle:{id}")))
    }

    #[must_use]
    pub fn delete_window(pool: &PoolId, version: &VersionTag) -> TupleOp {
        TupleOp::DeleteEntity(EntityId(format!("window:{pool}@{version}")))
    }
}

fn unix_now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
