//! Drives pools toward their desired state.
//!
//! The reconciler is the only writer of handle lifecycle: it launches
//! sandboxes when supply is short, drains and terminates surplus or
//! superseded handles, replaces the persistently unhealthy, and deletes
//! windows that have fully drained. Passes are idempotent over state
//! snapshots, so a dropped event or a crash mid-pass is repaired by the
//! next tick. Wakeups (tick, bus events, error requeues) are funneled
//! through the [`scheduler`](crate::scheduler) and executed by a
//! [`Runner`] that keeps passes serial per pool and parallel across
//! pools.

use crate::{
    backoff::retry_transient,
    config::RuntimeConfig,
    events::{Bus, Event},
    handle::SandboxHandle,
    journal::Journal,
    health::HealthMonitor,
    pool::Pool,
    registry::SharedPools,
    scheduler::{scheduler, ScheduleRequest},
    utils::BerthStreamExt,
};
use berth_core::{
    bridge::{ContainerBridge, LaunchSpec},
    sink::{EventSink, LifecycleEvent, LifecycleKind},
    store::TupleOp,
    HandleId, Phase, PoolId, VersionTag,
};
use futures::{channel::mpsc, stream, SinkExt, StreamExt};
use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug_span, Instrument};

mod future_hash_map;
mod runner;

use runner::Runner;

const KILL_SIGNAL: i32 = 15;
const KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum Error {
    /// The journal write failed; the pass aborted and the next one will
    /// reread from the store.
    #[error("journal write failed for pool {0}")]
    Journal(PoolId, #[source] berth_core::store::Error),
}

/// Why a pass was requested. Ignored for dedup purposes: a pool occupies
/// one wakeup slot and the first reason wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileReason {
    Tick,
    HandleFailed,
    HandleUnhealthy,
    ScaleIntentChanged,
    VersionActivated,
    ErrorRetry,
}

impl Display for ReconcileReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileReason::Tick => "tick",
            ReconcileReason::HandleFailed => "handle failed",
            ReconcileReason::HandleUnhealthy => "handle unhealthy",
            ReconcileReason::ScaleIntentChanged => "scale intent changed",
            ReconcileReason::VersionActivated => "version activated",
            ReconcileReason::ErrorRetry => "error retry",
        };
        f.write_str(s)
    }
}

/// A request to reconcile one pool. Equality and hashing consider only
/// the pool so that the scheduler and runner key their slots per pool.
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub pool: PoolId,
    pub reason: ReconcileReason,
}

impl PartialEq for ReconcileRequest {
    fn eq(&self, other: &Self) -> bool {
        self.pool == other.pool
    }
}

impl Eq for ReconcileRequest {}

impl Hash for ReconcileRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pool.hash(state);
    }
}

#[derive(Clone)]
pub struct Reconciler {
    pools: SharedPools,
    bridge: Arc<dyn ContainerBridge>,
    monitor: HealthMonitor,
    journal: Journal,
    bus: Bus,
    sink: Arc<dyn EventSink>,
    config: Arc<RuntimeConfig>,
    cancel: CancellationToken,
    next_handle: Arc<AtomicU64>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        pools: SharedPools,
        bridge: Arc<dyn ContainerBridge>,
        monitor: HealthMonitor,
        journal: Journal,
        bus: Bus,
        sink: Arc<dyn EventSink>,
        config: Arc<RuntimeConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pools,
            bridge,
            monitor,
            journal,
            bus,
            sink,
            config,
            cancel,
            next_handle: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run until the cancellation token fires, then finish in-flight
    /// passes and return.
    pub async fn run(self) {
        let (requeue_tx, requeue_rx) = mpsc::channel::<ScheduleRequest>(100);

        let ticks = {
            let pools = self.pools.clone();
            let mut ticker = interval(self.config.reconcile_tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            stream::unfold(ticker, |mut ticker| async move {
                ticker.tick().await;
                Some(((), ticker))
            })
            .flat_map(move |()| {
                let due: Vec<ScheduleRequest> = pools
                    .lock()
                    .keys()
                    .map(|pool| ScheduleRequest {
                        request: ReconcileRequest {
                            pool: pool.clone(),
                            reason: ReconcileReason::Tick,
                        },
                        run_at: Instant::now(),
                    })
                    .collect();
                stream::iter(due)
            })
        };

        let wakeups = stream::unfold(self.bus.subscribe(), |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
        .filter_map(|event| async move {
            let reason = match &event {
                Event::HandleFailed { .. } => ReconcileReason::HandleFailed,
                Event::HandleUnhealthy { .. } => ReconcileReason::HandleUnhealthy,
                Event::ScaleIntentChanged { .. } => ReconcileReason::ScaleIntentChanged,
                Event::VersionActivated { .. } => ReconcileReason::VersionActivated,
                Event::HandleReady { .. } | Event::LeaseReleased { .. } => return None,
            };
            Some(ScheduleRequest {
                request: ReconcileRequest {
                    pool: event.pool().clone(),
                    reason,
                },
                run_at: Instant::now(),
            })
        });

        let requests = stream::select(stream::select(ticks, wakeups), requeue_rx)
            .take_until(self.cancel.clone().cancelled_owned())
            .on_complete(async { tracing::debug!("reconciler request stream drained") });

        let ctx = self.clone();
        Runner::new(scheduler(requests), move |request| {
            let ctx = ctx.clone();
            let request = request.clone();
            let span = debug_span!("reconcile", pool = %request.pool, reason = %request.reason);
            Box::pin(
                async move {
                    let result = ctx.reconcile_pool(&request.pool).await;
                    (request, result)
                }
                .instrument(span),
            )
        })
        .for_each(|(request, result)| {
            let mut requeue_tx = requeue_tx.clone();
            let retry_after = self.config.reconcile_tick;
            async move {
                if let Err(err) = result {
                    tracing::warn!(pool = %request.pool, error = %err, "reconcile pass failed");
                    // In graceful shutdown the channel may be gone; the
                    // next tick covers it.
                    let _ = requeue_tx
                        .send(ScheduleRequest {
                            request: ReconcileRequest {
                                pool: request.pool,
                                reason: ReconcileReason::ErrorRetry,
                            },
                            run_at: Instant::now() + retry_after,
                        })
                        .await;
                }
            }
        })
        .await;
        tracing::debug!("reconciler quiesced");
    }

    fn pool(&self, id: &PoolId) -> Option<Arc<Pool>> {
        self.pools.lock().get(id).cloned()
    }

    /// One pass over one pool. Mutations all land through the pool's
    /// narrow commit methods and are journaled in a single transaction
    /// at the end.
    pub async fn reconcile_pool(&self, id: &PoolId) -> Result<(), Error> {
        let Some(pool) = self.pool(id) else {
            return Ok(());
        };
        let mut removals: Vec<TupleOp> = Vec::new();

        self.advance_window_drains(&pool);
        self.reap_failed_handles(&pool, &mut removals).await;
        self.drain_superseded_windows(&pool, &mut removals).await;
        self.replace_unhealthy_handles(&pool, &mut removals).await;
        self.scale_active_window(&pool, &mut removals).await;

        self.journal
            .sync_pool(&pool, removals)
            .await
            .map_err(|err| Error::Journal(pool.id.clone(), err))?;

        // Repair path for dropped HandleReady / LeaseReleased events.
        pool.pump_waiters();
        Ok(())
    }

    /// Retiring windows flip to draining once the successor has a ready
    /// handle; until then the old version keeps serving (so a rollout
    /// onto a broken image never black-holes traffic). The deadline
    /// armed at activation then bounds how long drained handles linger;
    /// leased handles are still never interrupted.
    fn advance_window_drains(&self, pool: &Arc<Pool>) {
        use crate::window::WindowMode;
        let snap = pool.snapshot();
        let successor_ready = snap
            .active
            .as_ref()
            .and_then(|v| snap.window(v))
            .is_some_and(|w| w.handles.iter().any(|h| h.phase() == Phase::Ready));
        if !successor_ready {
            return;
        }
        for window in &snap.windows {
            if let WindowMode::Retiring { deadline } = window.mode {
                tracing::debug!(pool = %pool.id, version = %window.version, "draining superseded window");
                pool.begin_window_drain(&window.version, deadline);
            }
        }
    }

    /// Kill and evict `Failed` handles, feeding the poison tracker.
    async fn reap_failed_handles(&self, pool: &Arc<Pool>, removals: &mut Vec<TupleOp>) {
        let snap = pool.snapshot();
        for window in &snap.windows {
            for handle in &window.handles {
                if handle.phase() != Phase::Failed {
                    continue;
                }
                self.kill_task(&handle.id, &handle.task).await;
                pool.evict_handle(&window.version, &handle.id);
                removals.push(Journal::delete_handle(&handle.id));
                if pool.record_version_failure(
                    &window.version,
                    self.config.poison_window,
                    self.config.poison_threshold,
                ) {
                    self.sink.on_lifecycle_event(&LifecycleEvent {
                        pool: pool.id.clone(),
                        handle: None,
                        version: Some(window.version.clone()),
                        kind: LifecycleKind::VersionPoisoned,
                        reason: "repeated failures within poison window".into(),
                    });
                }
            }
        }
    }

    /// Terminate drained handles of draining windows and collect windows
    /// that are fully gone. Leased handles are left to finish; the next
    /// pass after their release reaps them.
    async fn drain_superseded_windows(&self, pool: &Arc<Pool>, removals: &mut Vec<TupleOp>) {
        use crate::window::WindowMode;
        let snap = pool.snapshot();
        for window in &snap.windows {
            if !matches!(window.mode, WindowMode::Draining { .. }) {
                continue;
            }
            for handle in &window.handles {
                if handle.phase() == Phase::Draining && handle.lease_count() == 0 {
                    self.terminate_handle(pool, &window.version, handle, removals)
                        .await;
                }
            }
            if pool.collect_window(&window.version) {
                removals.push(Journal::delete_window(&pool.id, &window.version));
                self.sink.on_lifecycle_event(&LifecycleEvent {
                    pool: pool.id.clone(),
                    handle: None,
                    version: Some(window.version.clone()),
                    kind: LifecycleKind::WindowDeleted,
                    reason: "window drained".into(),
                });
            }
        }
    }

    /// Handles unhealthy for longer than `replace_after` are drained and
    /// terminated; the shortfall against `desired` relaunches them.
    async fn replace_unhealthy_handles(&self, pool: &Arc<Pool>, removals: &mut Vec<TupleOp>) {
        let now = Instant::now();
        let snap = pool.snapshot();
        for window in &snap.windows {
            for handle in &window.handles {
                if handle.phase() != Phase::Unhealthy {
                    continue;
                }
                let Some(unhealthy_for) = handle.unhealthy_for(now) else {
                    continue;
                };
                if unhealthy_for < self.config.replace_after {
                    continue;
                }
                tracing::info!(pool = %pool.id, handle = %handle.id, ?unhealthy_for, "replacing unhealthy handle");
                let _ = handle.begin_drain();
                if handle.lease_count() == 0 {
                    self.terminate_handle(pool, &window.version, handle, removals)
                        .await;
                }
            }
        }
    }

    /// Launch toward `desired`, pick victims above it, and sweep idle
    /// handles beyond the eviction threshold down to the scale floor.
    async fn scale_active_window(&self, pool: &Arc<Pool>, removals: &mut Vec<TupleOp>) {
        let snap = pool.snapshot();
        let Some(active) = snap.active.clone() else {
            return;
        };
        let Some(window) = snap.window(&active) else {
            return;
        };
        let current = window
            .handles
            .iter()
            .filter(|h| matches!(h.phase(), Phase::Ready | Phase::Starting))
            .count() as u32;
        let desired = snap.desired;

        if current < desired {
            if snap.poisoned.contains(&active) {
                tracing::warn!(pool = %pool.id, version = %active, "not launching: version poisoned");
                return;
            }
            self.launch_missing(pool, &active, desired - current).await;
        } else if current > desired {
            self.drain_surplus(pool, window, current - desired, removals)
                .await;
        }

        self.sweep_idle(pool, &active, removals).await;
    }

    async fn launch_missing(&self, pool: &Arc<Pool>, version: &VersionTag, missing: u32) {
        let Some(image) = pool.image_for(version) else {
            tracing::debug!(pool = %pool.id, %version, "no image recorded, cannot launch");
            return;
        };
        let spec = pool.spec();
        let launch_spec = LaunchSpec {
            image,
            env: spec.env.clone(),
            cpu_limit_millis: spec.cpu_limit_millis,
            mem_limit_bytes: spec.mem_limit_bytes,
        };
        for _ in 0..missing {
            if self.cancel.is_cancelled() {
                return;
            }
            let launched = timeout(
                self.config.launch_timeout,
                retry_transient("sandbox launch", || self.bridge.launch(&launch_spec)),
            )
            .await;
            let launched = match launched {
                Ok(Ok(launched)) => launched,
                Ok(Err(err)) => {
                    tracing::warn!(pool = %pool.id, %version, error = %err, "sandbox launch failed");
                    self.note_launch_failure(pool, version);
                    return;
                }
                Err(_) => {
                    tracing::warn!(pool = %pool.id, %version, "sandbox launch timed out");
                    self.note_launch_failure(pool, version);
                    return;
                }
            };
            let id = HandleId::new(format!("sbx-{}", self.next_handle.fetch_add(1, Ordering::Relaxed)));
            let handle = SandboxHandle::new(
                id.clone(),
                pool.id.clone(),
                version.clone(),
                launched.task.clone(),
                launched.endpoint,
                unix_now_ms(),
            );
            match pool.admit_handle(handle.clone()) {
                Ok(()) => {
                    tracing::info!(pool = %pool.id, handle = %id, %version, "sandbox launched");
                    self.sink.on_lifecycle_event(&LifecycleEvent {
                        pool: pool.id.clone(),
                        handle: Some(id),
                        version: Some(version.clone()),
                        kind: LifecycleKind::HandleCreated,
                        reason: "scaling toward desired".into(),
                    });
                    self.monitor.watch(pool, handle);
                }
                Err(orphan) => {
                    // The window vanished while we launched (rollout or
                    // teardown raced us): reap the orphan task.
                    tracing::debug!(pool = %pool.id, %version, "window gone, reaping orphan launch");
                    self.kill_task(&orphan.id, &orphan.task).await;
                    return;
                }
            }
        }
    }

    fn note_launch_failure(&self, pool: &Arc<Pool>, version: &VersionTag) {
        if pool.record_version_failure(
            version,
            self.config.poison_window,
            self.config.poison_threshold,
        ) {
            self.sink.on_lifecycle_event(&LifecycleEvent {
                pool: pool.id.clone(),
                handle: None,
                version: Some(version.clone()),
                kind: LifecycleKind::VersionPoisoned,
                reason: "repeated launch failures".into(),
            });
        }
        // No event wakeup here: an immediate retry would hammer a broken
        // image. The next tick retries, and the poison tracker caps it.
    }

    /// Oldest-idle `Ready` handles with zero leases go first; leased
    /// handles are never interrupted.
    async fn drain_surplus(
        &self,
        pool: &Arc<Pool>,
        window: &crate::pool::WindowSnapshot,
        surplus: u32,
        removals: &mut Vec<TupleOp>,
    ) {
        let mut victims: Vec<_> = window
            .handles
            .iter()
            .filter(|h| h.phase() == Phase::Ready && h.lease_count() == 0)
            .collect();
        victims.sort_by_key(|h| h.last_idle());
        for handle in victims.into_iter().take(surplus as usize) {
            if handle.begin_drain().is_ok() && handle.lease_count() == 0 {
                self.terminate_handle(pool, &window.version, handle, removals)
                    .await;
            }
        }
    }

    /// Reclaim handles idle beyond the pool's eviction threshold,
    /// keeping at least the scale floor alive and folding the shrink
    /// back into `desired`.
    async fn sweep_idle(&self, pool: &Arc<Pool>, active: &VersionTag, removals: &mut Vec<TupleOp>) {
        let now = Instant::now();
        let spec = pool.spec();
        let snap = pool.snapshot();
        let Some(window) = snap.window(active) else {
            return;
        };
        let mut alive = window
            .handles
            .iter()
            .filter(|h| h.phase().live())
            .count() as u32;
        let mut evicted = 0u32;
        let mut idle: Vec<_> = window
            .handles
            .iter()
            .filter_map(|h| {
                (h.phase() == Phase::Ready)
                    .then(|| h.idle_for(now).map(|d| (d, h)))
                    .flatten()
            })
            .filter(|(d, _)| *d >= spec.idle_eviction)
            .collect();
        idle.sort_by_key(|(d, _)| std::cmp::Reverse(*d));
        for (idle_for, handle) in idle {
            if alive <= spec.bounds.min {
                break;
            }
            tracing::info!(pool = %pool.id, handle = %handle.id, ?idle_for, "reclaiming idle handle");
            if handle.begin_drain().is_ok() && handle.lease_count() == 0 {
                self.terminate_handle(pool, active, handle, removals).await;
                alive -= 1;
                evicted += 1;
            }
        }
        if evicted > 0 && snap.desired > alive {
            pool.set_desired(alive.max(spec.bounds.min), Default::default());
        }
    }

    async fn terminate_handle(
        &self,
        pool: &Arc<Pool>,
        version: &VersionTag,
        handle: &Arc<SandboxHandle>,
        removals: &mut Vec<TupleOp>,
    ) {
        self.kill_task(&handle.id, &handle.task).await;
        match handle.terminate() {
            Ok(()) => {
                pool.evict_handle(version, &handle.id);
                removals.push(Journal::delete_handle(&handle.id));
                self.sink.on_lifecycle_event(&LifecycleEvent {
                    pool: pool.id.clone(),
                    handle: Some(handle.id.clone()),
                    version: Some(version.clone()),
                    kind: LifecycleKind::PhaseChanged {
                        from: Phase::Draining,
                        to: Phase::Terminated,
                    },
                    reason: "terminated by reconciler".into(),
                });
            }
            Err(err) => {
                // A lease raced in between our check and the terminate;
                // leave it for the pass after release.
                tracing::debug!(handle = %handle.id, error = %err, "terminate deferred");
            }
        }
    }

    async fn kill_task(&self, handle: &HandleId, task: &berth_core::TaskId) {
        let result = retry_transient("sandbox kill", || {
            self.bridge.kill(task, KILL_SIGNAL, KILL_GRACE)
        })
        .await;
        match result {
            Ok(code) => tracing::debug!(%handle, %task, code, "task killed"),
            Err(berth_core::bridge::Error::UnknownTask(_)) => {}
            Err(err) => tracing::warn!(%handle, %task, error = %err, "kill failed, task may leak"),
        }
    }
}

fn unix_now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PoolSpec,
        testing::{FakeBridge, FlakyProber, MemoryStore},
    };
    use berth_core::sink::NullSink;
    use hashbrown::HashMap;
    use parking_lot::Mutex;

    struct Fixture {
        reconciler: Reconciler,
        pool: Arc<Pool>,
        bridge: Arc<FakeBridge>,
        store: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(RuntimeConfig::default());
        let bus = Bus::new(64);
        let cancel = CancellationToken::new();
        let bridge = Arc::new(FakeBridge::new());
        let store = Arc::new(MemoryStore::default());
        let monitor = HealthMonitor::new(
            Arc::new(FlakyProber::healthy()),
            bus.clone(),
            config.clone(),
            cancel.clone(),
        );
        let pool = Pool::new(
            PoolSpec::new(PoolId::new("a1", "web")).with_bounds(0, 4),
            bus.clone(),
        );
        let pools: SharedPools = Arc::new(Mutex::new(HashMap::new()));
        pools.lock().insert(pool.id.clone(), pool.clone());
        let reconciler = Reconciler::new(
            pools,
            bridge.clone(),
            monitor,
            Journal::new(store.clone()),
            bus,
            Arc::new(NullSink),
            config,
            cancel,
        );
        Fixture {
            reconciler,
            pool,
            bridge,
            store,
        }
    }

    async fn settle_ready(fixture: &Fixture) {
        // Let the probe loops promote freshly launched handles.
        tokio::time::advance(Duration::from_millis(10)).await;
        for window in fixture.pool.snapshot().windows {
            for handle in window.handles {
                if handle.phase() == Phase::Starting {
                    handle.observe_health(true, 3);
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pass_launches_up_to_desired() {
        let f = fixture();
        f.pool
            .activate_version(VersionTag::new("v1"), "img:v1".into())
            .unwrap();
        f.pool.set_desired(2, Default::default());

        f.reconciler.reconcile_pool(&f.pool.id).await.unwrap();
        assert_eq!(f.bridge.launched_count(), 2);
        assert_eq!(f.pool.live_handles(), 2);
        assert!(f.store.tuple_count() > 0, "pass journals its state");
    }

    #[tokio::test(start_paused = true)]
    async fn pass_on_stable_state_mutates_nothing() {
        let f = fixture();
        f.pool
            .activate_version(VersionTag::new("v1"), "img:v1".into())
            .unwrap();
        f.pool.set_desired(2, Default::default());
        f.reconciler.reconcile_pool(&f.pool.id).await.unwrap();
        settle_ready(&f).await;

        f.reconciler.reconcile_pool(&f.pool.id).await.unwrap();
        assert_eq!(f.bridge.launched_count(), 2, "no relaunch on stable state");
        assert!(f.bridge.killed().is_empty(), "no termination on stable state");
        assert_eq!(f.pool.live_handles(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pass_drains_surplus_without_touching_leased_handles() {
        let f = fixture();
        f.pool
            .activate_version(VersionTag::new("v1"), "img:v1".into())
            .unwrap();
        f.pool.set_desired(2, Default::default());
        f.reconciler.reconcile_pool(&f.pool.id).await.unwrap();
        settle_ready(&f).await;

        // Lease one handle, then scale intent down to one.
        let crate::pool::AcquireOutcome::Granted((leased, lease)) =
            f.pool.acquire_or_wait().unwrap()
        else {
            panic!("ready pool should grant");
        };
        f.pool.set_desired(1, Default::default());
        f.reconciler.reconcile_pool(&f.pool.id).await.unwrap();

        assert_eq!(f.pool.live_handles(), 1, "idle surplus handle drained");
        assert_eq!(leased.phase(), Phase::Ready, "leased handle untouched");
        assert_eq!(leased.lease_count(), 1);
        f.pool.release(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn journal_failure_aborts_the_pass_with_an_error() {
        let f = fixture();
        f.pool
            .activate_version(VersionTag::new("v1"), "img:v1".into())
            .unwrap();
        f.pool.set_desired(1, Default::default());
        f.store.fail_next_transact();
        let err = f.reconciler.reconcile_pool(&f.pool.id).await.unwrap_err();
        assert!(matches!(err, Error::Journal(_, _)));
        // The next pass repairs: state is reread and persisted.
        f.reconciler.reconcile_pool(&f.pool.id).await.unwrap();
        assert!(f.store.tuple_count() > 0);
    }
}
