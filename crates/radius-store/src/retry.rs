//! Jittered exponential backoff for transient failures.

use std::{future::Future, time::Duration};

use rand::Rng;

/// Retry policy for transient errors. The delay before attempt `n` is
/// `base * 2^(n-1)` capped at `cap`, with up to the same amount of uniform
/// jitter added.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Backoff before the given 1-based attempt, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.cap);
        let jitter = rand::rng().random_range(0..=capped.as_millis() as u64);
        capped + Duration::from_millis(jitter)
    }
}

/// Runs `op` until it succeeds, fails permanently, or the attempt budget is
/// spent. `is_transient` decides which errors are worth another try.
pub async fn with_backoff<T, E, Fut>(
    policy: &BackoffPolicy,
    is_transient: impl Fn(&E) -> bool,
    mut op: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < policy.max_attempts && is_transient(&error) => {
                let delay = policy.delay(attempt);
                tracing::debug!(attempt, ?delay, "retrying transient storage error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_backoff(&fast_policy(), |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err("transient") } else { Ok(n) } }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_backoff(&fast_policy(), |_| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("permanent") }
        })
        .await;
        assert_eq!(result, Err("permanent"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_backoff(&fast_policy(), |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("transient") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
