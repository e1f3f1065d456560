//! Retry with exponential backoff for transient `PostgreSQL` failures.
//!
//! Only idempotent work goes through here: shop reads, id listing and
//! opening a transaction. Materialization is retried by stream redelivery,
//! never inside the store.

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

use std::future::Future;
use std::time::Duration;

use hotpath::errors::{StoreError, StoreResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Retry strategy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Exponential backoff cap
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to spread delays by ±20%
    pub use_jitter: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryStrategy {
    /// A single attempt.
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            use_jitter: false,
        }
    }

    /// Delay before attempt number `attempt` (zero-based; the first attempt has none).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay_ms =
            self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
        let capped = Duration::from_millis(delay_ms as u64).min(self.max_delay);

        if self.use_jitter {
            add_jitter(capped)
        } else {
            capped
        }
    }
}

fn add_jitter(delay: Duration) -> Duration {
    let factor = rand::rng().random_range(0.8..1.2);
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// `strategy.max_attempts` is reached. Returns the last error.
pub async fn retry_operation<F, Fut, T>(
    strategy: &RetryStrategy,
    operation_name: &str,
    mut operation: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let attempts = strategy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = operation_name, attempt = attempt + 1, "succeeded after retries");
                }
                return Ok(value);
            }
            Err(error) if error.is_retryable() && attempt + 1 < attempts => {
                attempt += 1;
                let delay = strategy.calculate_delay(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    ?delay,
                    error = %error,
                    "store operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Classifies a driver error into the store taxonomy.
pub fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => StoreError::UniqueViolation(
                db.constraint().unwrap_or("unique constraint").to_string(),
            ),
            Some("40001" | "40P01") => StoreError::Transaction(db.to_string()),
            Some(code) if code.starts_with("08") || code == "53300" || code == "57P01" => {
                StoreError::Connection(db.to_string())
            }
            _ => StoreError::Mapping(db.to_string()),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Connection(error.to_string()),
        _ => StoreError::Mapping(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryStrategy {
        RetryStrategy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            backoff_multiplier: 2.0,
            use_jitter: false,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let strategy = no_jitter();
        assert_eq!(strategy.calculate_delay(0), Duration::ZERO);
        assert_eq!(strategy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(strategy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(strategy.calculate_delay(3), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let strategy = RetryStrategy {
            use_jitter: true,
            ..no_jitter()
        };
        for _ in 0..100 {
            let delay = strategy.calculate_delay(1);
            assert!(delay >= Duration::from_millis(80) && delay <= Duration::from_millis(120));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let calls = AtomicU32::new(0);

        let result = retry_operation(&no_jitter(), "find_shop", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Connection("reset".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);

        let result: StoreResult<()> = retry_operation(&no_jitter(), "find_shop", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Mapping("bad column".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Mapping(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);

        let result: StoreResult<()> = retry_operation(&no_jitter(), "all_ids", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Connection("down".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn pool_exhaustion_is_a_connection_error() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolTimedOut),
            StoreError::Connection(_)
        ));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            StoreError::Mapping(_)
        ));
    }
}
