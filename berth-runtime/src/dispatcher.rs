//! The caller-facing lease handle.
//!
//! [`Registry::acquire_lease`](crate::registry::Registry::acquire_lease)
//! returns a [`Lease`]; dropping it releases, and explicit
//! [`release`](Lease::release) is an idempotent no-op the second time.
//! Cancellation is by drop: abandoning the acquire future removes the
//! waiter without ever incrementing a lease count.

use crate::pool::{Grant, Pool};
use berth_core::{bridge::Endpoint, HandleId, LeaseId, PoolId};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

struct ReleaseInner {
    pool: Weak<Pool>,
    lease: LeaseId,
    released: AtomicBool,
}

impl ReleaseInner {
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.lease);
        }
    }
}

impl Drop for ReleaseInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// A reservation of one sandbox for one request.
///
/// Clones share the release token; the lease is released once, on the
/// first explicit `release` or when the last clone drops.
#[derive(Clone)]
pub struct Lease {
    pool: PoolId,
    handle: HandleId,
    endpoint: Endpoint,
    inner: Arc<ReleaseInner>,
}

impl Lease {
    #[must_use]
    pub(crate) fn new(pool: &Arc<Pool>, grant: Grant) -> Self {
        let (handle, lease) = grant;
        Self {
            pool: pool.id.clone(),
            handle: handle.id.clone(),
            endpoint: handle.endpoint.clone(),
            inner: Arc::new(ReleaseInner {
                pool: Arc::downgrade(pool),
                lease,
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Where to send the request.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn handle(&self) -> &HandleId {
        &self.handle
    }

    #[must_use]
    pub fn pool(&self) -> &PoolId {
        &self.pool
    }

    /// Release the reservation. Safe to call any number of times.
    pub fn release(&self) {
        self.inner.release();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.pool)
            .field("handle", &self.handle)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
