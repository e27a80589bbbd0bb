//! Bounded exponential backoff used around flaky collaborators.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff: the delay before retry `n` (0-based) is
/// `min_delay * multiplier^n`, clamped to `[min_delay, max_delay]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Backoff {
    /// Policy for fetching TLS material from the credential store:
    /// 3 attempts, waiting between 3s and 12s.
    pub fn credential_fetch() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(12),
            multiplier: 2.0,
        }
    }

    /// Single attempt, never sleeps.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.min_delay.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = base
            .max(self.min_delay.as_secs_f64())
            .min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Run `op` until it succeeds, fails with an error `is_transient` rejects,
    /// or the attempts are used up. The last error is returned.
    pub async fn run<T, E, F, Fut>(&self, mut op: F, is_transient: impl Fn(&E) -> bool) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= attempts || !is_transient(&err) => return Err(err),
                Err(err) => {
                    let delay = self.delay_for(attempt - 1);
                    warn!(%err, attempt, ?delay, "transient failure; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::credential_fetch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant(max_attempts: u32) -> Backoff {
        Backoff {
            max_attempts,
            ..Backoff::none()
        }
    }

    #[test]
    fn credential_fetch_delays_are_clamped() {
        let b = Backoff::credential_fetch();
        assert_eq!(b.delay_for(0), Duration::from_secs(3));
        assert_eq!(b.delay_for(1), Duration::from_secs(6));
        assert_eq!(b.delay_for(2), Duration::from_secs(12));
        assert_eq!(b.delay_for(5), Duration::from_secs(12));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, String> = instant(3)
            .run(
                move || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err("flaky".to_string())
                    } else {
                        Ok(n)
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> = instant(3)
            .run(
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("down".to_string())
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Err("down".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> = instant(3)
            .run(
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("missing".to_string())
                },
                |_| false,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
