//! In-memory fakes for the external collaborators.
//!
//! Deterministic under a paused tokio clock; used by this crate's own
//! tests and available to downstream integration tests.

use crate::{autoscaler::queries, health::{ProbeError, Prober}};
use berth_core::{
    bridge::{self, ContainerBridge, Endpoint, LaunchSpec, Launched, TaskStats},
    metrics::{self, MetricsReader, Series},
    store::{self, EntityStore, Tuple, TupleOp},
    PoolId, TaskId,
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

/// Container bridge that "launches" instantly (or after a configured
/// delay) and hands out sequential loopback endpoints.
#[derive(Default)]
pub struct FakeBridge {
    next_task: AtomicU64,
    launch_delay: Mutex<Duration>,
    fail_launches: AtomicU32,
    running: Mutex<HashMap<TaskId, LaunchSpec>>,
    killed: Mutex<Vec<TaskId>>,
}

impl FakeBridge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` launches fail with a transient error.
    pub fn fail_next_launches(&self, n: u32) {
        self.fail_launches.store(n, Ordering::SeqCst);
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        *self.launch_delay.lock() = delay;
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    #[must_use]
    pub fn launched_count(&self) -> u64 {
        self.next_task.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn killed(&self) -> Vec<TaskId> {
        self.killed.lock().clone()
    }
}

#[async_trait::async_trait]
impl ContainerBridge for FakeBridge {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Launched, bridge::Error> {
        let delay = *self.launch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(bridge::Error::Unavailable("injected launch failure".into()));
        }
        let n = self.next_task.fetch_add(1, Ordering::SeqCst);
        let task = TaskId::new(format!("task-{n}"));
        self.running.lock().insert(task.clone(), spec.clone());
        Ok(Launched {
            task,
            endpoint: Endpoint {
                host: "127.0.0.1".into(),
                port: 30000 + n as u16,
            },
        })
    }

    async fn kill(&self, task: &TaskId, _signal: i32, _grace: Duration) -> Result<i32, bridge::Error> {
        if self.running.lock().remove(task).is_none() {
            return Err(bridge::Error::UnknownTask(task.clone()));
        }
        self.killed.lock().push(task.clone());
        Ok(0)
    }

    async fn stats(&self, task: &TaskId) -> Result<TaskStats, bridge::Error> {
        if self.running.lock().contains_key(task) {
            Ok(TaskStats::default())
        } else {
            Err(bridge::Error::UnknownTask(task.clone()))
        }
    }
}

/// Entity store backed by a map; transactions apply atomically.
#[derive(Default)]
pub struct MemoryStore {
    tuples: Mutex<HashMap<(String, String), serde_json::Value>>,
    fail_next: AtomicBool,
}

impl MemoryStore {
    /// The next `transact` aborts without applying anything.
    pub fn fail_next_transact(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn tuple_count(&self) -> usize {
        self.tuples.lock().len()
    }
}

#[async_trait::async_trait]
impl EntityStore for MemoryStore {
    async fn transact(&self, ops: Vec<TupleOp>) -> Result<(), store::Error> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(store::Error::Aborted("injected failure".into()));
        }
        let mut tuples = self.tuples.lock();
        for op in ops {
            match op {
                TupleOp::Put(tuple) => {
                    tuples.insert((tuple.entity.0, tuple.attr.0), tuple.value);
                }
                TupleOp::Delete(entity, attr) => {
                    tuples.remove(&(entity.0, attr.0));
                }
                TupleOp::DeleteEntity(entity) => {
                    tuples.retain(|(e, _), _| e != &entity.0);
                }
            }
        }
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<Tuple>, store::Error> {
        Ok(self
            .tuples
            .lock()
            .iter()
            .filter(|((entity, _), _)| entity.starts_with(prefix))
            .map(|((entity, attr), value)| Tuple::new(entity.clone(), attr.clone(), value.clone()))
            .collect())
    }
}

/// Metrics reader answering the autoscaler's exact query strings from a
/// table the test controls.
#[derive(Default)]
pub struct StaticMetrics {
    values: Mutex<HashMap<String, f64>>,
}

impl StaticMetrics {
    pub fn set(&self, expr: impl Into<String>, value: f64) {
        self.values.lock().insert(expr.into(), value);
    }

    pub fn set_rps(&self, pool: &PoolId, value: f64) {
        self.set(queries::rps(pool), value);
    }

    pub fn set_cores(&self, pool: &PoolId, value: f64) {
        self.set(queries::cores(pool), value);
    }

    pub fn set_p95_ms(&self, pool: &PoolId, value: f64) {
        self.set(queries::p95_ms(pool), value);
    }
}

#[async_trait::async_trait]
impl MetricsReader for StaticMetrics {
    async fn instant_query(&self, expr: &str) -> Result<Option<f64>, metrics::Error> {
        Ok(self.values.lock().get(expr).copied())
    }

    async fn range_query(
        &self,
        expr: &str,
        start: u64,
        _end: u64,
        _step: Duration,
    ) -> Result<Series, metrics::Error> {
        Ok(self
            .values
            .lock()
            .get(expr)
            .map(|value| Series {
                points: vec![(start, *value)],
            })
            .unwrap_or_default())
    }
}

/// Prober that plays back a script of outcomes, then repeats the last
/// one forever. An empty script reports healthy.
pub struct FlakyProber {
    script: Mutex<VecDeque<bool>>,
    last: AtomicBool,
}

impl FlakyProber {
    #[must_use]
    pub fn healthy() -> Self {
        Self::script([])
    }

    #[must_use]
    pub fn unhealthy() -> Self {
        let prober = Self::script([]);
        prober.last.store(false, Ordering::SeqCst);
        prober
    }

    #[must_use]
    pub fn script(outcomes: impl IntoIterator<Item = bool>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            last: AtomicBool::new(true),
        }
    }
}

#[async_trait::async_trait]
impl Prober for FlakyProber {
    async fn probe(&self, _endpoint: &Endpoint) -> Result<(), ProbeError> {
        let healthy = match self.script.lock().pop_front() {
            Some(outcome) => {
                self.last.store(outcome, Ordering::SeqCst);
                outcome
            }
            None => self.last.load(Ordering::SeqCst),
        };
        if healthy {
            Ok(())
        } else {
            Err(ProbeError::Connect("scripted failure".into()))
        }
    }
}
