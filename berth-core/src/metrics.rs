//! Read-only metrics contract consumed by the autoscaler.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("metrics backend unavailable: {0}")]
    Unavailable(String),

    #[error("bad query {0:?}: {1}")]
    BadQuery(String, String),
}

/// A numeric series: `(unix_millis, value)` points in ascending order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub points: Vec<(u64, f64)>,
}

impl Series {
    /// Arithmetic mean over the points, `None` when empty.
    #[must_use]
    pub fn mean(&self) -> Option<f64> {
        if self.points.is_empty() {
            return None;
        }
        let sum: f64 = self.points.iter().map(|(_, v)| v).sum();
        Some(sum / self.points.len() as f64)
    }
}

/// The metrics reader. May be called concurrently; the runtime never
/// writes through it.
#[async_trait::async_trait]
pub trait MetricsReader: Send + Sync {
    /// Evaluate `expr` now. `None` when the backend has no data for it.
    async fn instant_query(&self, expr: &str) -> Result<Option<f64>, Error>;

    /// Evaluate `expr` over `[start, end]` at `step` resolution, with
    /// bounds in unix milliseconds.
    async fn range_query(
        &self,
        expr: &str,
        start: u64,
        end: u64,
        step: Duration,
    ) -> Result<Series, Error>;
}

#[cfg(test)]
mod tests {
    use super::Series;

    #[test]
    fn mean_of_empty_series_is_none() {
        assert_eq!(Series::default().mean(), None);
    }

    #[test]
    fn mean_averages_points() {
        let series = Series {
            points: vec![(0, 2.0), (1, 4.0)],
        };
        assert_eq!(series.mean(), Some(3.0));
    }
}
