//! Delays and deduplicates reconcile wakeups.
//!
//! Wakeup sources (tickers, bus events, requeues) all funnel into one
//! queue; a pool occupies at most one slot, the earliest requested run
//! time wins, and requests for a pool whose pass is still running are
//! held pending until the runner frees the slot.

use crate::reconciler::ReconcileRequest;
use futures::{stream::Fuse, Stream, StreamExt};
use hashbrown::{hash_map::Entry, HashMap, HashSet};
use pin_project::pin_project;
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::time::delay_queue::{self, DelayQueue};

/// A request to wake the reconciler for one pool at `run_at`.
#[derive(Debug)]
pub struct ScheduleRequest {
    pub request: ReconcileRequest,
    pub run_at: Instant,
}

struct ScheduledEntry {
    run_at: Instant,
    queue_key: delay_queue::Key,
}

#[pin_project(project = SchedulerProj)]
pub struct Scheduler<R> {
    /// Queue of scheduled wakeups. `scheduled` below is the canonical
    /// metadata; always take the request back out through it.
    queue: DelayQueue<ReconcileRequest>,
    scheduled: HashMap<ReconcileRequest, ScheduledEntry>,
    /// Wakeups that have expired but are held because their pool's pass
    /// is still running.
    pending: HashSet<ReconcileRequest>,
    #[pin]
    requests: Fuse<R>,
    /// Added to each request's expiry; lets a burst of events for one
    /// pool collapse into a single pass.
    debounce: Duration,
}

impl<R: Stream> Scheduler<R> {
    fn new(requests: R, debounce: Duration) -> Self {
        Self {
            queue: DelayQueue::new(),
            scheduled: HashMap::new(),
            pending: HashSet::new(),
            requests: requests.fuse(),
            debounce,
        }
    }
}

impl<'a, R> SchedulerProj<'a, R> {
    /// If the pool is already queued the earlier `run_at` wins; the
    /// reason of the surviving request is kept.
    fn schedule_request(&mut self, request: ScheduleRequest) {
        if self.pending.contains(&request.request) {
            // Already expired and waiting on the runner; nothing to expedite.
            return;
        }
        let run_at = request.run_at + *self.debounce;
        match self.scheduled.entry(request.request) {
            Entry::Occupied(mut old_entry) if old_entry.get().run_at >= run_at => {
                let entry = old_entry.get_mut();
                self.queue.reset_at(&entry.queue_key, run_at);
                entry.run_at = run_at;
                old_entry.replace_key();
            }
            Entry::Occupied(_old_entry) => {
                // The queued wakeup runs sooner; drop the new request.
            }
            Entry::Vacant(entry) => {
                let request = entry.key().clone();
                entry.insert(ScheduledEntry {
                    run_at,
                    queue_key: self.queue.insert_at(request, run_at),
                });
            }
        }
    }

    fn poll_pop_queue(
        &mut self,
        cx: &mut Context<'_>,
        can_take: impl Fn(&ReconcileRequest) -> bool,
    ) -> Poll<ReconcileRequest> {
        if let Some(request) = self.pending.iter().find(|r| can_take(r)).cloned() {
            return Poll::Ready(self.pending.take(&request).expect("just found"));
        }

        loop {
            match self.queue.poll_expired(cx) {
                Poll::Ready(Some(request)) => {
                    let request = request.into_inner();
                    let (request, _) = self
                        .scheduled
                        .remove_entry(&request)
                        .expect("expired wakeup was missing from scheduled metadata");
                    if can_take(&request) {
                        break Poll::Ready(request);
                    }
                    self.pending.insert(request);
                }
                Poll::Ready(None) | Poll::Pending => break Poll::Pending,
            }
        }
    }
}

/// A filtered view of the [`Scheduler`] that keeps requests pending
/// while `can_take` rejects them, i.e. while the pool's previous pass is
/// still in flight.
pub struct HoldUnless<'a, R, C> {
    scheduler: Pin<&'a mut Scheduler<R>>,
    can_take: C,
}

impl<'a, R, C> Stream for HoldUnless<'a, R, C>
where
    R: Stream<Item = ScheduleRequest>,
    C: Fn(&ReconcileRequest) -> bool + Unpin,
{
    type Item = ReconcileRequest;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let can_take = &this.can_take;
        let mut scheduler = this.scheduler.as_mut().project();

        loop {
            match scheduler.requests.as_mut().poll_next(cx) {
                Poll::Ready(Some(request)) => scheduler.schedule_request(request),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => break,
            }
        }

        match scheduler.poll_pop_queue(cx, can_take) {
            Poll::Ready(expired) => Poll::Ready(Some(expired)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<R> Scheduler<R>
where
    R: Stream<Item = ScheduleRequest>,
{
    pub fn hold_unless<C: Fn(&ReconcileRequest) -> bool>(
        self: Pin<&mut Self>,
        can_take: C,
    ) -> HoldUnless<'_, R, C> {
        HoldUnless {
            scheduler: self,
            can_take,
        }
    }

    #[cfg(test)]
    pub fn contains_pending(&self, request: &ReconcileRequest) -> bool {
        self.pending.contains(request)
    }
}

impl<R> Stream for Scheduler<R>
where
    R: Stream<Item = ScheduleRequest>,
{
    type Item = ReconcileRequest;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.as_mut().hold_unless(|_| true)).poll_next(cx)
    }
}

/// Wakeup queue without debounce: requests are deduplicated per pool and
/// the earliest run time wins. Terminates as soon as `requests` does.
pub fn scheduler<S: Stream<Item = ScheduleRequest>>(requests: S) -> Scheduler<S> {
    Scheduler::new(requests, Duration::ZERO)
}

/// Wakeup queue that additionally waits for `debounce` of quiet time per
/// pool before emitting, collapsing event bursts into one pass.
pub fn debounced_scheduler<S: Stream<Item = ScheduleRequest>>(
    requests: S,
    debounce: Duration,
) -> Scheduler<S> {
    Scheduler::new(requests, debounce)
}
