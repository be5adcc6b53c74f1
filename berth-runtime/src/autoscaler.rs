//! Demand-driven scaling intent.
//!
//! Once per tick the autoscaler reads the smoothed request rate, core
//! usage, and p95 latency for every pool and computes a desired count.
//! Increases apply immediately; decreases only after the lower target
//! has held for the cooldown, and scale-to-zero additionally requires
//! the pool to have been idle for `idle_to_zero`. The autoscaler never
//! launches or terminates anything itself; it writes intent and the
//! reconciler actuates.

use crate::{config::RuntimeConfig, pool::Pool, registry::SharedPools};
use berth_core::{intent::ScaleRationale, metrics::MetricsReader, PoolId};
use hashbrown::HashMap;
use std::sync::Arc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Query expressions the autoscaler issues. Kept in one place so the
/// in-memory test reader can answer the exact same strings.
pub mod queries {
    use berth_core::PoolId;

    #[must_use]
    pub fn rps(pool: &PoolId) -> String {
        format!("rate(berth_requests_total{{pool=\"{pool}\"}}[1m])")
    }

    #[must_use]
    pub fn cores(pool: &PoolId) -> String {
        format!("avg_over_time(berth_cpu_cores{{pool=\"{pool}\"}}[1m])")
    }

    #[must_use]
    pub fn p95_ms(pool: &PoolId) -> String {
        format!("histogram_quantile(0.95, rate(berth_request_ms_bucket{{pool=\"{pool}\"}}[1m]))")
    }
}

#[derive(Debug, Default)]
struct Hysteresis {
    /// Since when every computed target has been below the applied one.
    below_since: Option<Instant>,
    /// Since when the pool has shown zero request rate.
    zero_rps_since: Option<Instant>,
}

pub struct Autoscaler {
    pools: SharedPools,
    metrics: Arc<dyn MetricsReader>,
    config: Arc<RuntimeConfig>,
    cancel: CancellationToken,
    state: HashMap<PoolId, Hysteresis>,
}

impl Autoscaler {
    #[must_use]
    pub fn new(
        pools: SharedPools,
        metrics: Arc<dyn MetricsReader>,
        config: Arc<RuntimeConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pools,
            metrics,
            config,
            cancel,
            state: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.config.autoscale_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("autoscaler stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            let pools: Vec<Arc<Pool>> = self.pools.lock().values().cloned().collect();
            for pool in pools {
                self.evaluate(&pool).await;
            }
        }
    }

    /// Revise intent for one pool; at most one revision per tick.
    #[tracing::instrument(skip(self, pool), fields(pool = %pool.id))]
    async fn evaluate(&mut self, pool: &Arc<Pool>) {
        let spec = pool.spec();
        let rps = self.read(&queries::rps(&pool.id)).await.unwrap_or(0.0);
        let cores = self.read(&queries::cores(&pool.id)).await.unwrap_or(0.0);
        let p95_ms = self.read(&queries::p95_ms(&pool.id)).await;

        let target_rps = (rps / spec.per_instance_rps).ceil() as u32;
        let target_cpu = (cores / spec.per_instance_cores).ceil() as u32;
        let target = spec.bounds.clamp(target_rps.max(target_cpu));
        let rationale = ScaleRationale { rps, cores, p95_ms };

        let now = Instant::now();
        let applied = pool.desired();
        let entry = self.state.entry(pool.id.clone()).or_default();

        if rps > 0.0 {
            entry.zero_rps_since = None;
        } else if entry.zero_rps_since.is_none() {
            entry.zero_rps_since = Some(now);
        }

        if target > applied {
            entry.below_since = None;
            tracing::debug!(target, applied, rps, cores, "scaling up");
            pool.set_desired(target, rationale);
            return;
        }
        if target == applied {
            entry.below_since = None;
            return;
        }

        // target < applied: hold the decrease until it has been stable
        // for the cooldown.
        let since = *entry.below_since.get_or_insert(now);
        if now.saturating_duration_since(since) < self.config.scale_down_cooldown {
            return;
        }

        if target == 0 {
            // Scale-to-zero needs sustained zero offered load and a
            // fully idle pool.
            let zero_long_enough = entry
                .zero_rps_since
                .is_some_and(|z| now.saturating_duration_since(z) >= self.config.idle_to_zero);
            let pool_idle = pool.live_handles() == 0
                || pool
                    .idle_for(now)
                    .is_some_and(|idle| idle >= self.config.idle_to_zero);
            if !(zero_long_enough && pool_idle) {
                return;
            }
        }

        entry.below_since = None;
        tracing::debug!(target, applied, "scaling down");
        pool.set_desired(target, rationale);
    }

    async fn read(&self, expr: &str) -> Option<f64> {
        match self.metrics.instant_query(expr).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, expr, "metrics query failed, skipping signal");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PoolSpec,
        events::Bus,
        testing::StaticMetrics,
    };
    use std::time::Duration;

    fn setup(min: u32, max: u32) -> (Arc<Pool>, Arc<StaticMetrics>, Autoscaler) {
        let pool = Pool::new(
            PoolSpec::new(PoolId::new("a1", "web"))
                .with_bounds(min, max)
                .with_capacity(10.0, 1.0),
            Bus::new(16),
        );
        let pools: SharedPools = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        pools.lock().insert(pool.id.clone(), pool.clone());
        let metrics = Arc::new(StaticMetrics::default());
        let scaler = Autoscaler::new(
            pools,
            metrics.clone(),
            Arc::new(RuntimeConfig::default()),
            CancellationToken::new(),
        );
        (pool, metrics, scaler)
    }

    #[tokio::test(start_paused = true)]
    async fn increase_applies_immediately() {
        let (pool, metrics, mut scaler) = setup(0, 4);
        metrics.set_rps(&pool.id, 35.0);
        scaler.evaluate(&pool).await;
        assert_eq!(pool.desired(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cpu_target_wins_when_higher() {
        let (pool, metrics, mut scaler) = setup(0, 8);
        metrics.set_rps(&pool.id, 11.0); // -> 2
        metrics.set_cores(&pool.id, 2.5); // -> 3
        scaler.evaluate(&pool).await;
        assert_eq!(pool.desired(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn decrease_waits_for_cooldown() {
        let (pool, metrics, mut scaler) = setup(0, 8);
        metrics.set_rps(&pool.id, 35.0);
        scaler.evaluate(&pool).await;
        assert_eq!(pool.desired(), 4);

        metrics.set_rps(&pool.id, 11.0);
        scaler.evaluate(&pool).await;
        assert_eq!(pool.desired(), 4, "decrease applied before cooldown");

        tokio::time::advance(Duration::from_secs(181)).await;
        scaler.evaluate(&pool).await;
        assert_eq!(pool.desired(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bounce_resets_the_cooldown() {
        let (pool, metrics, mut scaler) = setup(0, 8);
        metrics.set_rps(&pool.id, 35.0);
        scaler.evaluate(&pool).await;

        metrics.set_rps(&pool.id, 11.0);
        scaler.evaluate(&pool).await;
        tokio::time::advance(Duration::from_secs(120)).await;
        // Load returns: the pending decrease must be forgotten.
        metrics.set_rps(&pool.id, 35.0);
        scaler.evaluate(&pool).await;
        metrics.set_rps(&pool.id, 11.0);
        tokio::time::advance(Duration::from_secs(120)).await;
        scaler.evaluate(&pool).await;
        assert_eq!(pool.desired(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn scale_to_zero_needs_sustained_idle() {
        let (pool, metrics, mut scaler) = setup(0, 4);
        metrics.set_rps(&pool.id, 5.0);
        scaler.evaluate(&pool).await;
        assert_eq!(pool.desired(), 1);

        metrics.set_rps(&pool.id, 0.0);
        scaler.evaluate(&pool).await;
        tokio::time::advance(Duration::from_secs(181)).await;
        scaler.evaluate(&pool).await;
        assert_eq!(pool.desired(), 1, "zero rps not yet sustained for idle_to_zero");

        tokio::time::advance(Duration::from_secs(130)).await;
        scaler.evaluate(&pool).await;
        assert_eq!(pool.desired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_bounds_override_demand() {
        let (pool, metrics, mut scaler) = setup(3, 3);
        metrics.set_rps(&pool.id, 0.0);
        pool.set_desired(3, Default::default());
        tokio::time::advance(Duration::from_secs(600)).await;
        scaler.evaluate(&pool).await;
        assert_eq!(pool.desired(), 3);

        metrics.set_rps(&pool.id, 200.0);
        scaler.evaluate(&pool).await;
        assert_eq!(pool.desired(), 3);
    }
}
