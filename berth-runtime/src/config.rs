//! Runtime and per-pool configuration.

use berth_core::{intent::ScaleBounds, PoolId, VersionTag};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Process-wide knobs. Every timing default from the scheduler design
/// lives here so tests can compress them under a paused clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Default dispatcher acquire deadline.
    #[serde(with = "duration_secs")]
    pub acquire_timeout: Duration,
    /// Per-sandbox launch budget inside a reconcile pass.
    #[serde(with = "duration_secs")]
    pub launch_timeout: Duration,
    /// Health probe cadence per handle.
    #[serde(with = "duration_secs")]
    pub probe_interval: Duration,
    /// Transport-level budget for a single probe attempt.
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
    /// Consecutive probe failures past the grace period before a handle
    /// goes `Unhealthy`.
    pub probe_fail_threshold: u32,
    /// A `Starting` handle that has not probed healthy within this is
    /// declared `Failed`.
    #[serde(with = "duration_secs")]
    pub start_deadline: Duration,
    /// Autoscaler cadence.
    #[serde(with = "duration_secs")]
    pub autoscale_tick: Duration,
    /// A lower target must hold this long before it is applied.
    #[serde(with = "duration_secs")]
    pub scale_down_cooldown: Duration,
    /// Zero-rps idle time before the autoscaler proposes `desired = 0`.
    #[serde(with = "duration_secs")]
    pub idle_to_zero: Duration,
    /// Reconciler cadence (event wakeups come sooner).
    #[serde(with = "duration_secs")]
    pub reconcile_tick: Duration,
    /// Unhealthy-for-longer-than-this handles are terminated and
    /// replaced.
    #[serde(with = "duration_secs")]
    pub replace_after: Duration,
    /// Failed launches/handles of one version within this window count
    /// toward poisoning.
    #[serde(with = "duration_secs")]
    pub poison_window: Duration,
    /// Failures within the window that poison a version.
    pub poison_threshold: u32,
    /// Bounded per-subscriber event queue; overflow drops the oldest.
    pub event_bus_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
            launch_timeout: Duration::from_secs(90),
            probe_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(2),
            probe_fail_threshold: 3,
            start_deadline: Duration::from_secs(300),
            autoscale_tick: Duration::from_secs(10),
            scale_down_cooldown: Duration::from_secs(180),
            idle_to_zero: Duration::from_secs(300),
            reconcile_tick: Duration::from_secs(2),
            replace_after: Duration::from_secs(60),
            poison_window: Duration::from_secs(300),
            poison_threshold: 3,
            event_bus_capacity: 64,
        }
    }
}

/// Static description of one pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub id: PoolId,
    #[serde(default)]
    pub bounds: ScaleBounds,
    /// Requests per second one instance is provisioned for.
    pub per_instance_rps: f64,
    /// Cores one instance is provisioned for.
    pub per_instance_cores: f64,
    /// Hard cap of concurrent leases per handle; a saturated window makes
    /// acquires wait rather than exceed it.
    pub per_handle_concurrency: u32,
    /// Idle duration after which a handle above the scale floor is
    /// reclaimed.
    #[serde(with = "duration_secs")]
    pub idle_eviction: Duration,
    /// Probe failures within this period after launch are not counted.
    #[serde(with = "duration_secs")]
    pub health_grace: Duration,
    /// Old-version windows get this long to drain after a rollout.
    #[serde(with = "duration_secs")]
    pub drain_grace: Duration,
    pub cpu_limit_millis: u32,
    pub mem_limit_bytes: u64,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl PoolSpec {
    /// A spec with production defaults for everything but identity.
    #[must_use]
    pub fn new(id: PoolId) -> Self {
        Self {
            id,
            bounds: ScaleBounds::default(),
            per_instance_rps: 10.0,
            per_instance_cores: 1.0,
            per_handle_concurrency: 8,
            idle_eviction: Duration::from_secs(300),
            health_grace: Duration::from_secs(30),
            drain_grace: Duration::from_secs(30),
            cpu_limit_millis: 1000,
            mem_limit_bytes: 512 << 20,
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_bounds(mut self, min: u32, max: u32) -> Self {
        self.bounds = ScaleBounds { min, max };
        self
    }

    #[must_use]
    pub fn with_cap(mut self, per_handle_concurrency: u32) -> Self {
        self.per_handle_concurrency = per_handle_concurrency;
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, rps: f64, cores: f64) -> Self {
        self.per_instance_rps = rps;
        self.per_instance_cores = cores;
        self
    }
}

/// An activated version: the tag plus the image it launches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSpec {
    pub tag: VersionTag,
    pub image: String,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(de)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.probe_fail_threshold, 3);
        assert_eq!(config.idle_to_zero, Duration::from_secs(300));
    }

    #[test]
    fn config_roundtrips_through_serde() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<RuntimeConfig>(&json).unwrap(), config);
    }
}
