//! Central retry policy for transient infrastructure failures.
//!
//! The reconciler (bridge calls) and the health monitor share the same
//! capped exponential policy, so retry behaviour stays uniform and
//! testable in one place.

use backon::{ExponentialBuilder, Retryable};
use std::{fmt::Display, future::Future, time::Duration};

/// Capped exponential backoff for transient infrastructure errors.
#[must_use]
pub fn transient_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(4)
}

/// Run `op` under [`transient_policy`], logging each retry with `what`
/// for context. The final error is returned unchanged.
pub async fn retry_transient<T, E, F, Fut>(what: &'static str, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    op.retry(transient_policy())
        .notify(|err, delay| {
            tracing::debug!(error = %err, ?delay, what, "transient failure, retrying");
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::retry_transient;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_transient("test op", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("not yet")
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_cap_and_returns_last_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), &str> = retry_transient("test op", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err("still broken")
        })
        .await;
        assert_eq!(result, Err("still broken"));
        // Initial attempt plus four retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }
}
