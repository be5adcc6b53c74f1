//! The pool registry: the single initialisation point of the runtime.
//!
//! Owns the pool map, wires the background loops (reconciler,
//! autoscaler, health probes, waiter pump), exposes the public API
//! surface, and runs the shutdown phase: refuse new leases, cancel the
//! loops, wait for reconciler quiescence, persist final state.

use crate::{
    autoscaler::Autoscaler,
    config::{PoolSpec, RuntimeConfig},
    dispatcher::Lease,
    events::{Bus, Event},
    handle::SandboxHandle,
    health::{HealthMonitor, Prober, TcpProber},
    journal::Journal,
    pool::{AcquireOutcome, Pool, PoolStatus},
    reconciler::Reconciler,
    window::WindowMode,
};
use berth_core::{
    bridge::ContainerBridge,
    intent::ScaleBounds,
    metrics::MetricsReader,
    record::WindowState,
    sink::{EventSink, NullSink},
    store::EntityStore,
    AcquireError, AppId, ConfigError, PoolId, ServiceName, VersionTag,
};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

/// The pool lookup table, shared with the background loops.
pub type SharedPools = Arc<Mutex<HashMap<PoolId, Arc<Pool>>>>;

/// Builder for [`Registry`]; collaborators in, running registry out.
pub struct Builder {
    bridge: Arc<dyn ContainerBridge>,
    store: Arc<dyn EntityStore>,
    metrics: Arc<dyn MetricsReader>,
    prober: Arc<dyn Prober>,
    sink: Arc<dyn EventSink>,
    config: RuntimeConfig,
}

impl Builder {
    #[must_use]
    pub fn new(
        bridge: Arc<dyn ContainerBridge>,
        store: Arc<dyn EntityStore>,
        metrics: Arc<dyn MetricsReader>,
    ) -> Self {
        Self {
            bridge,
            store,
            metrics,
            prober: Arc::new(TcpProber),
            sink: Arc::new(NullSink),
            config: RuntimeConfig::default(),
        }
    }

    #[must_use]
    pub fn prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Rebuild state from the journal and start the background loops.
    pub async fn start(self) -> Result<Arc<Registry>, berth_core::store::Error> {
        let config = Arc::new(self.config);
        let bus = Bus::new(config.event_bus_capacity);
        let cancel = CancellationToken::new();
        let pools: SharedPools = Arc::new(Mutex::new(HashMap::new()));
        let journal = Journal::new(self.store);
        let monitor = HealthMonitor::new(self.prober, bus.clone(), config.clone(), cancel.clone());

        let registry = Arc::new(Registry {
            pools: pools.clone(),
            bus: bus.clone(),
            journal: journal.clone(),
            monitor: monitor.clone(),
            config: config.clone(),
            cancel: cancel.clone(),
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        registry.restore().await?;

        let reconciler = Reconciler::new(
            pools.clone(),
            self.bridge,
            monitor,
            journal,
            bus.clone(),
            self.sink,
            config.clone(),
            cancel.clone(),
        );
        let autoscaler = Autoscaler::new(pools.clone(), self.metrics, config, cancel.clone());

        let mut tasks = registry.tasks.lock();
        tasks.push(tokio::spawn(reconciler.run()));
        tasks.push(tokio::spawn(autoscaler.run()));
        tasks.push(tokio::spawn(pump_loop(pools, bus, cancel)));
        drop(tasks);

        Ok(registry)
    }
}

pub struct Registry {
    pools: SharedPools,
    bus: Bus,
    journal: Journal,
    monitor: HealthMonitor,
    config: Arc<RuntimeConfig>,
    cancel: CancellationToken,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Registry {
    #[must_use]
    pub fn builder(
        bridge: Arc<dyn ContainerBridge>,
        store: Arc<dyn EntityStore>,
        metrics: Arc<dyn MetricsReader>,
    ) -> Builder {
        Builder::new(bridge, store, metrics)
    }

    fn pool(&self, id: &PoolId) -> Option<Arc<Pool>> {
        self.pools.lock().get(id).cloned()
    }

    /// Register (or re-register) a pool. Idempotent on the id; an
    /// existing pool keeps its runtime state and takes the new spec's
    /// bounds.
    pub async fn create_pool(&self, spec: PoolSpec) -> Result<(), ConfigError> {
        if !spec.bounds.valid() {
            return Err(ConfigError::InvalidBounds {
                min: spec.bounds.min,
                max: spec.bounds.max,
            });
        }
        let pool = {
            let mut pools = self.pools.lock();
            match pools.get(&spec.id) {
                Some(existing) => {
                    existing.set_bounds(spec.bounds)?;
                    existing.clone()
                }
                None => {
                    let pool = Pool::new(spec.clone(), self.bus.clone());
                    pools.insert(spec.id.clone(), pool.clone());
                    pool
                }
            }
        };
        tracing::info!(pool = %pool.id, "pool registered");
        // A failed write here is repaired by the next reconcile pass,
        // which re-journals the whole pool.
        if let Err(err) = self.journal.sync_pool(&pool, Vec::new()).await {
            tracing::warn!(pool = %pool.id, error = %err, "pool registration not yet persisted");
        }
        Ok(())
    }

    /// Remove a pool entirely once it has scaled to zero.
    pub async fn delete_pool(&self, id: &PoolId) -> Result<(), ConfigError> {
        let Some(pool) = self.pool(id) else {
            return Err(ConfigError::UnknownPool(id.clone()));
        };
        if pool.live_handles() > 0 || pool.ledger.outstanding() > 0 {
            return Err(ConfigError::PoolBusy(id.clone()));
        }
        self.pools.lock().remove(id);
        if let Err(err) = self.journal.remove_pool(&pool).await {
            tracing::warn!(pool = %id, error = %err, "failed to remove pool records");
        }
        Ok(())
    }

    /// `AcquireLease`: returns a ready handle's endpoint plus a release
    /// token, waiting up to `deadline` on a cold or saturated pool.
    /// Dropping the returned future cancels cleanly: the queued waiter
    /// is discarded and no lease count moves.
    pub async fn acquire_lease(
        &self,
        app: impl Into<AppId>,
        service: impl Into<ServiceName>,
        deadline: Duration,
    ) -> Result<Lease, AcquireError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(AcquireError::ShuttingDown);
        }
        let id = PoolId {
            app: app.into(),
            service: service.into(),
        };
        let Some(pool) = self.pool(&id) else {
            return Err(AcquireError::UnknownPool(id));
        };
        match pool.acquire_or_wait()? {
            AcquireOutcome::Granted(grant) => Ok(Lease::new(&pool, grant)),
            AcquireOutcome::Wait(rx) => match timeout(deadline, rx).await {
                Ok(Ok(grant)) => Ok(Lease::new(&pool, grant)),
                // Waiters are dropped wholesale only in shutdown.
                Ok(Err(_closed)) => Err(AcquireError::ShuttingDown),
                Err(_elapsed) => Err(AcquireError::Timeout(pool.id.clone())),
            },
        }
    }

    /// Like [`acquire_lease`](Self::acquire_lease) with the configured
    /// default deadline.
    pub async fn acquire_lease_default(
        &self,
        app: impl Into<AppId>,
        service: impl Into<ServiceName>,
    ) -> Result<Lease, AcquireError> {
        let deadline = self.config.acquire_timeout;
        self.acquire_lease(app, service, deadline).await
    }

    /// `SetDesiredScale`: operator bounds. Rejected synchronously when
    /// `min > max`; no state change on error.
    pub fn set_desired_scale(&self, id: &PoolId, min: u32, max: u32) -> Result<(), ConfigError> {
        let Some(pool) = self.pool(id) else {
            return Err(ConfigError::UnknownPool(id.clone()));
        };
        pool.set_bounds(ScaleBounds { min, max })
    }

    /// `ActivateVersion`: route new leases to `version` once it has a
    /// ready handle; prior versions drain after the grace period.
    pub fn activate_version(
        &self,
        id: &PoolId,
        version: VersionTag,
        image: impl Into<String>,
    ) -> Result<(), ConfigError> {
        let Some(pool) = self.pool(id) else {
            return Err(ConfigError::UnknownPool(id.clone()));
        };
        let image = image.into();
        if image.trim().is_empty() {
            return Err(ConfigError::ImageNotFound(image));
        }
        pool.activate_version(version, image)
    }

    /// `DescribePool`.
    pub fn describe_pool(&self, id: &PoolId) -> Result<PoolStatus, ConfigError> {
        self.pool(id)
            .map(|pool| pool.status())
            .ok_or_else(|| ConfigError::UnknownPool(id.clone()))
    }

    /// Operator reset of a poisoned version; never automatic.
    pub fn reset_poison(&self, id: &PoolId, version: &VersionTag) -> Result<bool, ConfigError> {
        self.pool(id)
            .map(|pool| pool.reset_poison(version))
            .ok_or_else(|| ConfigError::UnknownPool(id.clone()))
    }

    /// Events dropped across all subscribers since start.
    #[must_use]
    pub fn lost_events(&self) -> u64 {
        self.bus.lost_events()
    }

    /// Shutdown phase: refuse new leases, stop the loops, wait for them
    /// to quiesce, persist final state. In-flight leases run on and may
    /// still be released afterwards.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("runtime shutting down");
        let pools: Vec<Arc<Pool>> = self.pools.lock().values().cloned().collect();
        for pool in &pools {
            pool.begin_shutdown();
        }
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "background task aborted uncleanly");
            }
        }
        for pool in &pools {
            if let Err(err) = self.journal.sync_pool(pool, Vec::new()).await {
                tracing::warn!(pool = %pool.id, error = %err, "final persist failed");
            }
        }
        tracing::info!("runtime stopped");
    }

    /// Rebuild the pool graph from journal records. Live handles come
    /// back `Unhealthy` so no lease is granted until a probe proves the
    /// sandbox actually survived the restart.
    async fn restore(&self) -> Result<(), berth_core::store::Error> {
        let set = self.journal.load().await?;
        if set.pools.is_empty() {
            return Ok(());
        }
        tracing::info!(
            pools = set.pools.len(),
            handles = set.handles.len(),
            "restoring from journal"
        );
        let mut pools = self.pools.lock();
        for record in &set.pools {
            let pool = Pool::new(PoolSpec::new(record.id.clone()), self.bus.clone());
            pool.adopt_record(record);
            pools.insert(record.id.clone(), pool);
        }
        for record in &set.windows {
            let Some(pool) = pools.get(&record.pool) else {
                continue;
            };
            let mode = match record.window_state {
                WindowState::Active => WindowMode::Active,
                WindowState::Draining { deadline_unix_ms } => WindowMode::Draining {
                    deadline: unix_deadline_to_instant(deadline_unix_ms),
                },
                WindowState::Poisoned => WindowMode::Draining {
                    deadline: tokio::time::Instant::now(),
                },
            };
            // The active window was already recreated by adopt_record.
            if pool.active_version().as_ref() != Some(&record.version) {
                pool.adopt_window(&record.version, mode);
            }
        }
        for record in &set.handles {
            let Some(pool) = pools.get(&record.pool) else {
                continue;
            };
            let handle = SandboxHandle::adopt(record);
            if !handle.phase().live() {
                continue;
            }
            match pool.admit_handle(handle.clone()) {
                Ok(()) => self.monitor.watch(pool, handle),
                Err(orphan) => {
                    tracing::warn!(handle = %orphan.id, "adopted handle has no window, dropping");
                }
            }
        }
        Ok(())
    }
}

fn unix_deadline_to_instant(deadline_unix_ms: u64) -> tokio::time::Instant {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now_unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let left = Duration::from_millis(deadline_unix_ms.saturating_sub(now_unix_ms));
    tokio::time::Instant::now() + left
}

/// Fulfils pool waiters when supply events arrive: the event-driven
/// half of the lease path (the reconcile pass is the repair half).
async fn pump_loop(pools: SharedPools, bus: Bus, cancel: CancellationToken) {
    let mut sub = bus.subscribe();
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = sub.recv() => event,
        };
        match event {
            Some(Event::HandleReady { pool, .. } | Event::LeaseReleased { pool, .. }) => {
                let target = pools.lock().get(&pool).cloned();
                if let Some(target) = target {
                    target.pump_waiters();
                }
            }
            Some(_) => {}
            None => return,
        }
    }
}
