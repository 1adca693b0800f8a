//! Bounded retry for cross-process calls: fixed delay or exponential backoff.
//!
//! Every attempt after a failure sleeps `(0.5 + rand) × current_delay` (the exponential
//! strategy doubles the delay and caps it at `max_delay`). A policy with `max_retries = k`
//! performs exactly `k + 1` attempts before giving up with [`RetryError::TimeoutExceeded`].
//!
//! Policies are serializable (`{"type":"fixed",...}` / `{"type":"exponential",...}`) so
//! remote handles can carry them across the wire.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retry strategy wrapping any fallible async operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Retry up to `max_retries` times with a fixed base delay (seconds) between attempts.
    Fixed { max_retries: u32, delay: f64 },
    /// Retry up to `max_retries` times, doubling the delay each attempt up to `max_delay`.
    Exponential {
        max_retries: u32,
        base_delay: f64,
        max_delay: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed {
            max_retries: 10,
            delay: 5.0,
        }
    }
}

/// Raised when a retry budget is exhausted; carries the last underlying error.
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    #[error("max timeout exceeded at [{site}] after {attempts} attempts: {source}")]
    TimeoutExceeded {
        site: String,
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The last error the failing operation produced.
    pub fn into_source(self) -> E {
        match self {
            RetryError::TimeoutExceeded { source, .. } => source,
        }
    }
}

impl RetryPolicy {
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryPolicy::Fixed { max_retries, .. } => *max_retries,
            RetryPolicy::Exponential { max_retries, .. } => *max_retries,
        }
    }

    /// Delay to sleep after the given zero-based failed attempt, jitter applied.
    fn backoff(&self, attempt: u32) -> Duration {
        let jitter = 0.5 + rand::random::<f64>();
        let secs = match self {
            RetryPolicy::Fixed { delay, .. } => jitter * delay,
            RetryPolicy::Exponential {
                base_delay,
                max_delay,
                ..
            } => {
                let current = base_delay * 2f64.powi(attempt as i32);
                (jitter * current).min(*max_delay)
            }
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Runs `op` until it succeeds or the budget is exhausted.
    ///
    /// `site` labels the call site in logs and in the terminal error.
    pub async fn retry<T, E, F, Fut>(&self, site: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let max_retries = self.max_retries();
        for attempt in 0..=max_retries {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt == max_retries {
                        tracing::error!(site, "max timeout exceeded");
                        return Err(RetryError::TimeoutExceeded {
                            site: site.to_string(),
                            attempts: max_retries + 1,
                            source: e,
                        });
                    }
                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        site,
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        unreachable!("the final attempt always returns")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Error)]
    #[error("always fails")]
    struct AlwaysFails;

    fn instant_fixed(max_retries: u32) -> RetryPolicy {
        RetryPolicy::Fixed {
            max_retries,
            delay: 0.0,
        }
    }

    #[tokio::test]
    async fn perpetual_failure_performs_exactly_k_plus_one_attempts() {
        let attempts = AtomicU32::new(0);
        let policy = instant_fixed(3);
        let result: Result<(), _> = policy
            .retry("test", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AlwaysFails) }
            })
            .await;
        assert!(matches!(
            result,
            Err(RetryError::TimeoutExceeded { attempts: 4, .. })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn success_after_failures_returns_value() {
        let attempts = AtomicU32::new(0);
        let policy = instant_fixed(5);
        let value = policy
            .retry("test", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(AlwaysFails)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_retries_is_single_attempt() {
        let attempts = AtomicU32::new(0);
        let policy = instant_fixed(0);
        let result: Result<(), _> = policy
            .retry("test", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AlwaysFails) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn policies_round_trip_through_json() {
        let fixed = RetryPolicy::Fixed {
            max_retries: 10,
            delay: 5.0,
        };
        let json = serde_json::to_string(&fixed).unwrap();
        assert!(json.contains("\"type\":\"fixed\""));
        assert_eq!(serde_json::from_str::<RetryPolicy>(&json).unwrap(), fixed);

        let exp = RetryPolicy::Exponential {
            max_retries: 4,
            base_delay: 1.0,
            max_delay: 30.0,
        };
        let json = serde_json::to_string(&exp).unwrap();
        assert_eq!(serde_json::from_str::<RetryPolicy>(&json).unwrap(), exp);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::Exponential {
            max_retries: 10,
            base_delay: 8.0,
            max_delay: 10.0,
        };
        for attempt in 0..8 {
            assert!(policy.backoff(attempt) <= Duration::from_secs_f64(10.0));
        }
    }
}
