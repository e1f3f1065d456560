//! Bounded external calls.
//!
//! Every call to the cache backend or the relational store goes through
//! [`bounded`], which turns an elapsed timer into the caller's own timeout
//! variant instead of letting the call hang.

use std::future::Future;
use std::time::Duration;

use crate::errors::{BackendError, StoreError};

/// Error types that have a timeout variant.
pub trait TimeoutError {
    /// Builds the timeout variant for a call bounded by `limit`.
    fn timed_out(limit: Duration) -> Self;
}

impl TimeoutError for BackendError {
    fn timed_out(limit: Duration) -> Self {
        Self::Timeout(limit)
    }
}

impl TimeoutError for StoreError {
    fn timed_out(limit: Duration) -> Self {
        Self::Timeout(limit)
    }
}

/// Runs `future` for at most `limit`.
pub async fn bounded<T, E, F>(limit: Duration, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: TimeoutError,
{
    tokio::time::timeout(limit, future)
        .await
        .unwrap_or_else(|_| Err(E::timed_out(limit)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BackendResult;

    #[tokio::test(start_paused = true)]
    async fn slow_call_becomes_timeout() {
        let result: BackendResult<()> = bounded(Duration::from_secs(3), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert_eq!(result, Err(BackendError::Timeout(Duration::from_secs(3))));
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let result: Result<u8, StoreError> =
            bounded(Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }
}
