//! Liveness probing for sandbox handles.
//!
//! One loop per non-terminated handle, registered by the reconciler at
//! launch (or adoption) time. The loop opens a transport-level
//! connection each interval; successes promote `Starting` to `Ready`
//! and recover `Unhealthy` handles, failure streaks demote `Ready`, and
//! a `Starting` handle that never probes healthy within the start
//! deadline is declared `Failed`. The monitor only transitions phases
//! and publishes; the reconciler decides what to do about it.

use crate::{
    config::RuntimeConfig,
    events::{Bus, Event},
    handle::SandboxHandle,
    pool::Pool,
};
use berth_core::{bridge::Endpoint, Phase};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(String),
}

/// Transport-level liveness check, substituted by a fake in tests.
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> Result<(), ProbeError>;
}

/// Probes by opening (and immediately closing) a TCP connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProber;

#[async_trait::async_trait]
impl Prober for TcpProber {
    async fn probe(&self, endpoint: &Endpoint) -> Result<(), ProbeError> {
        tokio::net::TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map(drop)
            .map_err(|err| ProbeError::Connect(err.to_string()))
    }
}

#[derive(Clone)]
pub struct HealthMonitor {
    prober: Arc<dyn Prober>,
    bus: Bus,
    config: Arc<RuntimeConfig>,
    cancel: CancellationToken,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        prober: Arc<dyn Prober>,
        bus: Bus,
        config: Arc<RuntimeConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            prober,
            bus,
            config,
            cancel,
        }
    }

    /// Start the probe loop for `handle`. The loop exits on its own once
    /// the handle reaches a phase that no longer needs probing, or when
    /// the runtime shuts down.
    pub fn watch(&self, pool: &Arc<Pool>, handle: Arc<SandboxHandle>) {
        let monitor = self.clone();
        let grace = pool.spec().health_grace;
        tokio::spawn(async move {
            monitor.probe_loop(handle, grace).await;
        });
    }

    #[tracing::instrument(skip(self, handle, grace), fields(handle = %handle.id, pool = %handle.pool))]
    async fn probe_loop(&self, handle: Arc<SandboxHandle>, grace: Duration) {
        let started = Instant::now();
        let mut ticker = interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let phase = handle.phase();
            if matches!(phase, Phase::Draining | Phase::Terminated | Phase::Failed) {
                tracing::debug!(%phase, "probe loop ending");
                return;
            }

            let healthy = matches!(
                timeout(self.config.probe_timeout, self.prober.probe(&handle.endpoint)).await,
                Ok(Ok(()))
            );

            if healthy {
                let obs = handle.observe_health(true, self.config.probe_fail_threshold);
                if obs.transitioned() && obs.phase_after == Phase::Ready {
                    tracing::debug!(from = %obs.phase_before, "handle became ready");
                    self.bus.publish(Event::HandleReady {
                        pool: handle.pool.clone(),
                        handle: handle.id.clone(),
                    });
                }
                continue;
            }

            if phase == Phase::Starting {
                if started.elapsed() >= self.config.start_deadline {
                    tracing::warn!("handle never became ready within start deadline");
                    if handle.mark_failed().is_ok() {
                        self.bus.publish(Event::HandleFailed {
                            pool: handle.pool.clone(),
                            handle: handle.id.clone(),
                            version: handle.version.clone(),
                        });
                    }
                    return;
                }
                continue;
            }

            // Warm-up failures inside the grace period are not counted.
            if started.elapsed() < grace {
                continue;
            }
            let obs = handle.observe_health(false, self.config.probe_fail_threshold);
            if obs.transitioned() && obs.phase_after == Phase::Unhealthy {
                tracing::warn!(fails = obs.consecutive_fails, "handle went unhealthy");
                self.bus.publish(Event::HandleUnhealthy {
                    pool: handle.pool.clone(),
                    handle: handle.id.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::PoolSpec, testing::FlakyProber};
    use berth_core::{HandleId, PoolId, TaskId, VersionTag};
    use tokio::time::advance;

    fn config() -> Arc<RuntimeConfig> {
        Arc::new(RuntimeConfig::default())
    }

    fn pool_and_handle(bus: &Bus) -> (Arc<Pool>, Arc<SandboxHandle>) {
        let spec = PoolSpec::new(PoolId::new("a1", "web")).with_bounds(0, 4);
        let pool = Pool::new(spec, bus.clone());
        pool.activate_version(VersionTag::new("v1"), "img:v1".into())
            .unwrap();
        let handle = SandboxHandle::new(
            HandleId::new("h1"),
            pool.id.clone(),
            VersionTag::new("v1"),
            TaskId::new("t1"),
            Endpoint {
                host: "127.0.0.1".into(),
                port: 9000,
            },
            0,
        );
        pool.admit_handle(handle.clone()).ok().unwrap();
        (pool, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_promotes_and_publishes_ready() {
        let bus = Bus::new(16);
        let mut sub = bus.subscribe();
        let (pool, handle) = pool_and_handle(&bus);
        let monitor = HealthMonitor::new(
            Arc::new(FlakyProber::healthy()),
            bus.clone(),
            config(),
            CancellationToken::new(),
        );
        monitor.watch(&pool, handle.clone());

        advance(Duration::from_secs(3)).await;
        assert_eq!(handle.phase(), Phase::Ready);
        assert_eq!(
            sub.recv().await,
            Some(Event::HandleReady {
                pool: pool.id.clone(),
                handle: handle.id.clone(),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_keeps_ready_and_publishes_nothing() {
        let bus = Bus::new(16);
        let (pool, handle) = pool_and_handle(&bus);
        // Healthy through the grace period, then two failures, then a
        // recovery before the third.
        let mut outcomes = vec![true; 16];
        outcomes.extend([false, false, true]);
        let prober = Arc::new(FlakyProber::script(outcomes));
        let monitor = HealthMonitor::new(prober, bus.clone(), config(), CancellationToken::new());
        monitor.watch(&pool, handle.clone());

        advance(Duration::from_secs(40)).await;
        assert_eq!(handle.phase(), Phase::Ready);
        let mut sub = bus.subscribe();
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_streak_past_grace_demotes_to_unhealthy() {
        let bus = Bus::new(16);
        let (pool, handle) = pool_and_handle(&bus);
        // One success to go ready, then failures forever.
        let prober = Arc::new(FlakyProber::script([true, false]));
        let monitor = HealthMonitor::new(prober, bus.clone(), config(), CancellationToken::new());
        let mut sub = bus.subscribe();
        monitor.watch(&pool, handle.clone());

        advance(Duration::from_secs(40)).await;
        assert_eq!(handle.phase(), Phase::Unhealthy);
        assert!(handle.unhealthy_for(Instant::now()).is_some());
        // First event is the promotion, then the demotion.
        assert!(matches!(
            sub.recv().await,
            Some(Event::HandleReady { .. })
        ));
        assert!(matches!(
            sub.recv().await,
            Some(Event::HandleUnhealthy { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn starting_handle_fails_at_the_start_deadline() {
        let bus = Bus::new(16);
        let (pool, handle) = pool_and_handle(&bus);
        let prober = Arc::new(FlakyProber::unhealthy());
        let monitor = HealthMonitor::new(prober, bus.clone(), config(), CancellationToken::new());
        let mut sub = bus.subscribe();
        monitor.watch(&pool, handle.clone());

        advance(Duration::from_secs(302)).await;
        assert_eq!(handle.phase(), Phase::Failed);
        assert!(matches!(sub.recv().await, Some(Event::HandleFailed { .. })));
    }
}
