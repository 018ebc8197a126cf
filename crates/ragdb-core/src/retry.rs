use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Exponential backoff for transient failures.
///
/// `max_attempts` counts the first call, so `1` means "never retry".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_millis(200), max_delay: Duration::from_secs(5) }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay, ..Self::default() }
    }

    pub fn none() -> Self {
        Self { max_attempts: 1, base_delay: Duration::ZERO, max_delay: Duration::ZERO }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` calls have failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }
}

/// Result of a retried call plus how many calls it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return RetryOutcome { result: Ok(value), attempts: attempt },
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(what, attempt, ?delay, error = %e, "transient failure, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return RetryOutcome { result: Err(e), attempts: attempt },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy { max_attempts: 5, base_delay: Duration::from_millis(100), max_delay: Duration::from_millis(350) };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_only_transient() {
        let p = RetryPolicy::new(3, Duration::from_millis(10));
        let out: RetryOutcome<()> = retry_transient(&p, "test", |_| async { Err(Error::Transient("boom".into())) }).await;
        assert_eq!(out.attempts, 3);
        assert!(out.result.is_err());

        let out: RetryOutcome<()> = retry_transient(&p, "test", |_| async { Err(Error::Rejected("bad".into())) }).await;
        assert_eq!(out.attempts, 1);

        let out = retry_transient(&p, "test", |n| async move {
            if n < 2 { Err(Error::Transient("once".into())) } else { Ok(n) }
        })
        .await;
        assert_eq!(out.result.unwrap(), 2);
        assert_eq!(out.attempts, 2);
    }
}
