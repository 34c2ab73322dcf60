//! Cancellable, unbounded retry used by the pipeline loops.

use crate::error::IndexerError;
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// `base, 2*base, 4*base, ...` capped at `max_delay`, each jittered. Infinite.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let half_base = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(half_base)
            .max_delay(self.max_delay)
            .map(jitter)
    }

    /// Delay before the `attempt`-th retry (1-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        self.delays()
            .nth(attempt.saturating_sub(1))
            .unwrap_or(self.max_delay)
    }
}

/// Sleeps for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), IndexerError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(IndexerError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Runs `op` until it succeeds, backing off between attempts.
///
/// Only configuration errors and cancellation stop the loop. Fatal RPC errors
/// keep retrying but are logged as alerts, since giving up here would leave a
/// hole in the indexed history.
pub async fn retry_until_cancelled<T, F, Fut>(
    what: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, IndexerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IndexerError>>,
{
    let mut delays = policy.delays();
    let mut attempt: u64 = 0;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IndexerError::Cancelled),
            result = op() => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };

        attempt += 1;
        let delay = delays.next().unwrap_or(policy.max_delay);
        match &err {
            IndexerError::Transient(_) => {
                warn!("{} failed (attempt {}): {}, retrying in {:?}", what, attempt, err, delay)
            }
            _ => error!(
                alert = true,
                "{} failed (attempt {}): {}, retrying in {:?}", what, attempt, err, delay
            ),
        }

        sleep_or_cancel(delay, cancel).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delays_grow_and_are_capped() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(350));
        for delay in policy.delays().take(10) {
            assert!(delay <= Duration::from_millis(350));
        }
        assert!(policy.delay_for(20) <= Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2));
        let cancel = CancellationToken::new();

        let value = retry_until_cancelled("flaky call", policy, &cancel, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(IndexerError::Transient("connection reset".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn configuration_errors_are_not_retried() {
        let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2));
        let cancel = CancellationToken::new();
        let result: Result<(), _> = retry_until_cancelled("bad", policy, &cancel, || async {
            Err(IndexerError::Configuration("nope".into()))
        })
        .await;
        assert!(matches!(result, Err(IndexerError::Configuration(_))));
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> = retry_until_cancelled("never", policy, &cancel, || async {
            Err(IndexerError::Transient("down".into()))
        })
        .await;
        assert!(matches!(result, Err(IndexerError::Cancelled)));
    }
}
