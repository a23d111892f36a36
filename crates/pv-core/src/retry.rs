//! Bounded retry with exponential backoff

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::serde_utils::duration_millis;

/// Exponential backoff with jitter between attempts
pub struct ExponentialBackoff {
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from a retry policy
    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(
            policy.min_delay,
            policy.max_delay,
            policy.multiplier,
            policy.jitter,
        )
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            current: std::cmp::min(initial, max),
            max,
            multiplier,
            jitter,
        }
    }

    /// Get the next delay and advance the backoff
    ///
    /// Jitter is applied below the cap so a delay never exceeds `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        std::cmp::min(delay + Duration::from_secs_f64(jitter_amount), self.max)
    }
}

/// How often and how patiently to retry an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub min_delay: Duration,

    /// Upper bound on any delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Growth factor between delays
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// SSH into a freshly booted machine: 10 retries, 2s to 5s apart
    pub fn ssh_connect() -> Self {
        Self {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5),
            max_attempts: 11,
            ..Self::default()
        }
    }

    /// Poll the agent until tunnels are published: 10 retries, 1s to 2s apart
    pub fn tunnel_query() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(2),
            max_attempts: 11,
            ..Self::default()
        }
    }

    /// Re-run a long remote command after a broken pipe: 3 retries
    pub fn pipe_error() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            max_attempts: 4,
            ..Self::default()
        }
    }

    /// Agent connecting to the tunnel server at startup
    pub fn agent_connect() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Run `op` until it succeeds or attempts run out
    pub async fn retry<T, E, F, Fut>(&self, what: &str, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.retry_if(what, op, |_| true).await
    }

    /// Run `op` until it succeeds, attempts run out, or `should_retry`
    /// rejects an error. The last error is returned.
    pub async fn retry_if<T, E, F, Fut, P>(
        &self,
        what: &str,
        mut op: F,
        mut should_retry: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut backoff = ExponentialBackoff::from_policy(self);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt >= max_attempts || !should_retry(&e) {
                        return Err(RetryError {
                            attempts: attempt,
                            error: e,
                        });
                    }
                    let delay = backoff.next_delay();
                    tracing::debug!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        what,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// The last error of a retried operation
#[derive(Debug)]
pub struct RetryError<E> {
    /// Attempts made, including the failing one
    pub attempts: u32,
    /// Error of the final attempt
    pub error: E,
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        self.error
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempts)", self.error, self.attempts)
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_increases() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
            0.0,
        );

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(5), 2.0, 0.0);

        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_under_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(4), Duration::from_secs(5), 2.0, 1.0);
        for _ in 0..20 {
            assert!(backoff.next_delay() <= Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::ssh_connect();

        let result: Result<(), _> = policy
            .retry("connect", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("refused")
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 11);
        assert_eq!(err.attempts, 11);
        assert_eq!(err.into_inner(), "refused");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_if_stops_on_fatal_error() {
        let calls = AtomicU32::new(0);

        let result = RetryPolicy::ssh_connect()
            .retry_if(
                "connect",
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(if n == 0 { "refused" } else { "auth rejected" })
                },
                |e| *e == "refused",
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.unwrap_err().error, "auth rejected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_waiting() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let value = RetryPolicy::tunnel_query()
            .retry("query", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet")
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        // 1s then 2s
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: RetryPolicy =
            toml::from_str("min_delay = 250\nmax_attempts = 3").unwrap();
        assert_eq!(policy.min_delay, Duration::from_millis(250));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.max_delay, RetryPolicy::default().max_delay);
    }
}
