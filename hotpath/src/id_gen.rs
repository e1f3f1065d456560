//! Coordination-free monotonic ids.
//!
//! An id is `seconds since a custom epoch` shifted above a per-day sequence
//! drawn from an atomic counter `icr:{namespace}:{yyyy:mm:dd}` in the shared
//! backend. Instances only share the counter, never a lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::KeyValueStore;
use crate::clock::Clock;
use crate::config::IdConfig;
use crate::errors::{BackendError, BackendResult};
use crate::timeout::bounded;

/// Source of unique ids per namespace.
#[async_trait]
pub trait IdGenerator: Send + Sync {
    /// Next id in `namespace`; strictly greater than any id returned before.
    async fn next_id(&self, namespace: &str) -> BackendResult<u64>;
}

/// Timestamp-plus-sequence id generator over the key-value backend.
pub struct TimePartitionedIdGenerator {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: IdConfig,
    call_timeout: Duration,
}

impl std::fmt::Debug for TimePartitionedIdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimePartitionedIdGenerator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TimePartitionedIdGenerator {
    /// Creates a generator.
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: IdConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            kv,
            clock,
            config,
            call_timeout,
        }
    }
}

#[async_trait]
impl IdGenerator for TimePartitionedIdGenerator {
    async fn next_id(&self, namespace: &str) -> BackendResult<u64> {
        let now = self.clock.now().into_datetime();
        let seconds = u64::try_from(now.timestamp() - self.config.epoch_seconds).unwrap_or(0);
        let key = format!("icr:{namespace}:{}", now.format("%Y:%m:%d"));

        let sequence = bounded(self.call_timeout, self.kv.increment(&key)).await?;
        if sequence >> self.config.sequence_bits != 0 {
            return Err(BackendError::Unavailable(format!(
                "id sequence exhausted for {key}"
            )));
        }
        Ok((seconds << self.config.sequence_bits) | sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;
    use crate::types::Timestamp;
    use chrono::{TimeZone, Utc};

    fn generator(backend: &FakeBackend, sequence_bits: u32) -> TimePartitionedIdGenerator {
        TimePartitionedIdGenerator::new(
            Arc::new(backend.clone()),
            Arc::new(backend.clock.clone()),
            IdConfig {
                epoch_seconds: 1_704_067_200,
                sequence_bits,
            },
            Duration::from_secs(3),
        )
    }

    #[tokio::test]
    async fn ids_increase_within_and_across_seconds() {
        let backend = FakeBackend::new();
        backend
            .clock
            .set(Timestamp::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
        let ids = generator(&backend, 32);

        let a = ids.next_id("order").await.unwrap();
        let b = ids.next_id("order").await.unwrap();
        backend.clock.advance(Duration::from_secs(1));
        let c = ids.next_id("order").await.unwrap();

        assert!(a < b);
        assert!(b < c);
        assert_eq!(a & 0xFFFF_FFFF, 1);
        assert_eq!(c & 0xFFFF_FFFF, 3);
    }

    #[tokio::test]
    async fn new_day_restarts_sequence_but_stays_monotonic() {
        let backend = FakeBackend::new();
        backend
            .clock
            .set(Timestamp::new(Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 59).unwrap()));
        let ids = generator(&backend, 32);

        let before = ids.next_id("order").await.unwrap();
        backend.clock.advance(Duration::from_secs(1));
        let after = ids.next_id("order").await.unwrap();

        assert!(after > before);
        assert_eq!(after & 0xFFFF_FFFF, 1);
    }

    #[tokio::test]
    async fn namespaces_have_independent_sequences() {
        let backend = FakeBackend::new();
        let ids = generator(&backend, 32);

        ids.next_id("order").await.unwrap();
        let other = ids.next_id("refund").await.unwrap();
        assert_eq!(other & 0xFFFF_FFFF, 1);
    }

    #[tokio::test]
    async fn exhausted_sequence_is_an_error() {
        let backend = FakeBackend::new();
        let ids = generator(&backend, 1);

        ids.next_id("order").await.unwrap();
        assert!(ids.next_id("order").await.is_err());
    }

    #[tokio::test]
    async fn backend_failure_propagates() {
        let backend = FakeBackend::new();
        backend.fail(true);
        assert!(generator(&backend, 32).next_id("order").await.is_err());
    }
}
