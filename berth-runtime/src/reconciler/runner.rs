use super::future_hash_map::FutureHashMap;
use crate::{
    reconciler::ReconcileRequest,
    scheduler::{ScheduleRequest, Scheduler},
};
use futures::{Future, Stream, StreamExt};
use pin_project::pin_project;
use std::{
    pin::Pin,
    task::{Context, Poll},
};

/// Pulls wakeups from the [`Scheduler`] and runs one pass per pool in
/// parallel, while guaranteeing that a single pool is never reconciled
/// by two passes at once.
///
/// A wakeup for a pool whose pass is still running is held pending and
/// taken as soon as the pass finishes, so event-driven wakeups are never
/// lost, only coalesced.
#[pin_project]
pub struct Runner<R, F, MkF> {
    #[pin]
    scheduler: Scheduler<R>,
    run_request: MkF,
    slots: FutureHashMap<ReconcileRequest, F>,
}

impl<R, F, MkF> Runner<R, F, MkF>
where
    F: Future + Unpin,
    MkF: FnMut(&ReconcileRequest) -> F,
{
    pub fn new(scheduler: Scheduler<R>, run_request: MkF) -> Self {
        Self {
            scheduler,
            run_request,
            slots: FutureHashMap::default(),
        }
    }
}

impl<R, F, MkF> Stream for Runner<R, F, MkF>
where
    R: Stream<Item = ScheduleRequest>,
    F: Future + Unpin,
    MkF: FnMut(&ReconcileRequest) -> F,
{
    type Item = F::Output;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        let slots = this.slots;
        let scheduler = &mut this.scheduler;
        let has_active_slots = match slots.poll_next_unpin(cx) {
            Poll::Ready(Some(result)) => return Poll::Ready(Some(result)),
            Poll::Ready(None) => false,
            Poll::Pending => true,
        };
        loop {
            // Take wakeups whose pool has a free slot; leave the rest
            // queued so they run as soon as the in-flight pass ends.
            let next_request_poll = scheduler
                .as_mut()
                .hold_unless(|request| !slots.contains_key(request))
                .poll_next_unpin(cx);
            match next_request_poll {
                Poll::Ready(Some(request)) => {
                    let pass = (this.run_request)(&request);
                    let displaced = slots.insert(request, pass);
                    debug_assert!(displaced.is_none(), "pool pass slot was double-booked");
                    cx.waker().wake_by_ref();
                }
                Poll::Ready(None) => {
                    break if has_active_slots {
                        // No more wakeups, but passes are still running.
                        Poll::Pending
                    } else {
                        Poll::Ready(None)
                    };
                }
                Poll::Pending => break Poll::Pending,
            }
        }
    }
}
