//! Internal event bus.
//!
//! Carries scheduling signals between the health monitor, autoscaler,
//! reconciler, and dispatcher. Events transport identifiers and enum
//! tags only, never owning pointers. Delivery is a single broadcast
//! channel, so events stay ordered per pool; each subscriber has a
//! bounded queue and overflow drops its oldest event, counted so the
//! next full reconcile can repair any divergence.

use async_broadcast::{InactiveReceiver, Receiver, Sender, TryRecvError};
use berth_core::{HandleId, PoolId, VersionTag};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// A scheduling signal. Identifiers only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    HandleReady {
        pool: PoolId,
        handle: HandleId,
    },
    HandleUnhealthy {
        pool: PoolId,
        handle: HandleId,
    },
    HandleFailed {
        pool: PoolId,
        handle: HandleId,
        version: VersionTag,
    },
    LeaseReleased {
        pool: PoolId,
        handle: HandleId,
    },
    ScaleIntentChanged {
        pool: PoolId,
        desired: u32,
    },
    VersionActivated {
        pool: PoolId,
        version: VersionTag,
    },
}

impl Event {
    /// The pool the event belongs to; per-pool ordering is keyed on this.
    #[must_use]
    pub fn pool(&self) -> &PoolId {
        match self {
            Event::HandleReady { pool, .. }
            | Event::HandleUnhealthy { pool, .. }
            | Event::HandleFailed { pool, .. }
            | Event::LeaseReleased { pool, .. }
            | Event::ScaleIntentChanged { pool, .. }
            | Event::VersionActivated { pool, .. } => pool,
        }
    }
}

/// Publish half of the bus. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Bus {
    tx: Sender<Event>,
    // Keeps the channel open while no subscriber is active.
    _idle_rx: InactiveReceiver<Event>,
    lost: Arc<AtomicU64>,
}

impl Bus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity);
        tx.set_overflow(true);
        tx.set_await_active(false);
        Self {
            tx,
            _idle_rx: rx.deactivate(),
            lost: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish without blocking. With overflow enabled the channel evicts
    /// the oldest queued event instead of rejecting the new one.
    pub fn publish(&self, event: Event) {
        tracing::trace!(?event, "publishing");
        let _ = self.tx.try_broadcast(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> Subscriber {
        Subscriber {
            rx: self.tx.new_receiver(),
            lost: self.lost.clone(),
        }
    }

    /// Total events dropped across all subscribers since startup.
    #[must_use]
    pub fn lost_events(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

/// One subscriber's bounded view of the bus.
pub struct Subscriber {
    rx: Receiver<Event>,
    lost: Arc<AtomicU64>,
}

impl Subscriber {
    /// Wait for the next event. `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(async_broadcast::RecvError::Overflowed(n)) => {
                    self.lost.fetch_add(n, Ordering::Relaxed);
                    tracing::warn!(missed = n, "event bus overflow, reconcile will repair");
                }
                Err(async_broadcast::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests and drain loops.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Overflowed(n)) => {
                    self.lost.fetch_add(n, Ordering::Relaxed);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(pool: &str, handle: &str) -> Event {
        Event::HandleReady {
            pool: PoolId::new(pool, "web"),
            handle: HandleId::new(handle),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = Bus::new(8);
        let mut sub = bus.subscribe();
        bus.publish(ready("a1", "h1"));
        bus.publish(ready("a1", "h2"));
        assert_eq!(sub.recv().await, Some(ready("a1", "h1")));
        assert_eq!(sub.recv().await, Some(ready("a1", "h2")));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts_loss() {
        let bus = Bus::new(2);
        let mut sub = bus.subscribe();
        bus.publish(ready("a1", "h1"));
        bus.publish(ready("a1", "h2"));
        bus.publish(ready("a1", "h3"));
        // h1 was evicted to make room for h3.
        assert_eq!(sub.recv().await, Some(ready("a1", "h2")));
        assert_eq!(sub.recv().await, Some(ready("a1", "h3")));
        assert_eq!(bus.lost_events(), 1);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_does_not_block() {
        let bus = Bus::new(1);
        bus.publish(ready("a1", "h1"));
        bus.publish(ready("a1", "h2"));
        let mut sub = bus.subscribe();
        assert_eq!(sub.try_recv(), None);
    }
}
