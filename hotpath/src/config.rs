//! Configuration for every hotpath component.
//!
//! Sections carry the production constants as their `Default` values. Bounded
//! numeric knobs are `nutype` newtypes validated at construction, so a
//! `HotpathConfig` that exists is a config that can run.
//!
//! [`HotpathConfig::from_env`] overlays `HOTPATH_*` environment variables on
//! the defaults:
//!
//! | Variable                           | Field                              |
//! |------------------------------------|------------------------------------|
//! | `HOTPATH_CACHE_LOGICAL_TTL_SECS`   | `cache.logical_ttl`                |
//! | `HOTPATH_CACHE_JITTER_SECS`        | `cache.logical_jitter`             |
//! | `HOTPATH_CACHE_PHYSICAL_TTL_SECS`  | `cache.physical_ttl`               |
//! | `HOTPATH_LOCK_LEASE_MS`            | `lock.lease`                       |
//! | `HOTPATH_LOCK_RETRY_LEASE_MS`      | `lock.retry_lease`                 |
//! | `HOTPATH_FILTER_EXPECTED_ITEMS`    | `filter.expected_items`            |
//! | `HOTPATH_FILTER_FALSE_POSITIVE_RATE` | `filter.false_positive_rate`     |
//! | `HOTPATH_FILTER_MAX_LAG_MS`        | `filter.max_registration_lag`      |
//! | `HOTPATH_STREAM_KEY`               | `stream.stream_key`                |
//! | `HOTPATH_STREAM_GROUP`             | `stream.group`                     |
//! | `HOTPATH_STREAM_CONSUMERS`         | `stream.consumers`                 |
//! | `HOTPATH_STREAM_BATCH_SIZE`        | `stream.batch_size`                |
//! | `HOTPATH_BACKEND_TIMEOUT_MS`       | `backend.call_timeout`             |
//! | `HOTPATH_BACKGROUND_WORKERS`       | `background.workers`               |

use std::str::FromStr;
use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::errors::ConfigError;

/// Number of long-lived stream consumer workers.
///
/// Between 1 and 64.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 64),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct ConsumerCount(usize);

/// Maximum messages returned by one stream read.
///
/// Between 1 and 1000.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct BatchSize(usize);

/// Number of ids the existence filter is sized for.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct ExpectedItems(u64);

/// Target false-positive probability of the existence filter, strictly between 0 and 0.5.
#[nutype(
    validate(finite, greater = 0.0, less = 0.5),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Into, Serialize, Deserialize)
)]
pub struct FalsePositiveRate(f64);

/// Number of background pool workers.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 256),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct WorkerCount(usize);

/// Logical-expiry cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Prefix of shop cache keys; the shop id is appended
    pub key_prefix: String,
    /// Base logical TTL before jitter
    pub logical_ttl: Duration,
    /// Symmetric jitter applied to the logical TTL
    pub logical_jitter: Duration,
    /// Lower bound of a jittered logical TTL
    pub logical_floor: Duration,
    /// Real expiry of the stored entry
    pub physical_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "cache:shop:".to_string(),
            logical_ttl: Duration::from_secs(30 * 60),
            logical_jitter: Duration::from_secs(5 * 60),
            logical_floor: Duration::from_secs(5 * 60),
            physical_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Distributed mutex settings for cache rebuilds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Prefix of the miss-path rebuild lock
    pub key_prefix: String,
    /// Prefix of the stale-path background rebuild lock
    pub rebuild_key_prefix: String,
    /// Lease of the first acquisition attempt
    pub lease: Duration,
    /// Lease of the single retry after polling gave up
    pub retry_lease: Duration,
    /// Cache polling schedule while another instance rebuilds
    pub poll: BackoffPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: "lock:shop:".to_string(),
            rebuild_key_prefix: "lock:shop:rebuild:".to_string(),
            lease: Duration::from_secs(5),
            retry_lease: Duration::from_secs(3),
            poll: BackoffPolicy::default(),
        }
    }
}

/// Existence filter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Prefix of the bitmap key; the entity kind is appended
    pub key_prefix: String,
    /// Capacity the filter is sized for
    pub expected_items: ExpectedItems,
    /// Target false-positive probability at capacity
    pub false_positive_rate: FalsePositiveRate,
    /// Longest a created id may stay unregistered before it is reported
    pub max_registration_lag: Duration,
    /// Backoff between registration retries
    pub registration_retry: BackoffPolicy,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            key_prefix: "bloom:".to_string(),
            expected_items: ExpectedItems::try_new(100_000).unwrap_or_else(|_| unreachable!()),
            false_positive_rate: FalsePositiveRate::try_new(0.01)
                .unwrap_or_else(|_| unreachable!()),
            max_registration_lag: Duration::from_secs(2),
            registration_retry: BackoffPolicy {
                base: Duration::from_millis(50),
                multiplier: 2,
                cap: Duration::from_millis(500),
                max_attempts: 8,
                max_total: Duration::from_secs(2),
            },
        }
    }
}

/// Admission script key layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Prefix of the per-voucher stock counter
    pub stock_key_prefix: String,
    /// Prefix of the per-voucher admitted-buyer set
    pub buyers_key_prefix: String,
    /// Id generator namespace of order ids
    pub order_namespace: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            stock_key_prefix: "seckill:stock:".to_string(),
            buyers_key_prefix: "seckill:order:".to_string(),
            order_namespace: "order".to_string(),
        }
    }
}

/// Order stream and consumer group settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream carrying order intents
    pub stream_key: String,
    /// Consumer group of the materializers
    pub group: String,
    /// Consumer names are `<prefix>-<n>`
    pub consumer_prefix: String,
    /// Fixed number of workers
    pub consumers: ConsumerCount,
    /// Messages per read
    pub batch_size: BatchSize,
    /// How long a read for new messages blocks
    pub block: Duration,
    /// Sleep after an empty read
    pub idle_sleep: Duration,
    /// Sleep after a transport or store failure
    pub error_backoff: Duration,
    /// Pending messages idle longer than this may be claimed from other consumers
    pub claim_min_idle: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_key: "stream.orders".to_string(),
            group: "order-group".to_string(),
            consumer_prefix: "consumer".to_string(),
            consumers: ConsumerCount::try_new(3).unwrap_or_else(|_| unreachable!()),
            batch_size: BatchSize::try_new(10).unwrap_or_else(|_| unreachable!()),
            block: Duration::from_secs(1),
            idle_sleep: Duration::from_millis(100),
            error_backoff: Duration::from_secs(2),
            claim_min_idle: Duration::from_secs(30),
        }
    }
}

/// Backend call settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Upper bound of any single cache or store call
    pub call_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(3),
        }
    }
}

/// Background pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// Worker tasks draining the queue
    pub workers: WorkerCount,
    /// Jobs that may wait before submissions are rejected
    pub queue_capacity: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            workers: WorkerCount::try_new(4).unwrap_or_else(|_| unreachable!()),
            queue_capacity: 1024,
        }
    }
}

/// Order id generator layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdConfig {
    /// Custom epoch in Unix seconds
    pub epoch_seconds: i64,
    /// Low bits reserved for the per-day sequence
    pub sequence_bits: u32,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            epoch_seconds: 1_704_067_200,
            sequence_bits: 32,
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HotpathConfig {
    /// Logical-expiry cache
    pub cache: CacheConfig,
    /// Rebuild locks
    pub lock: LockConfig,
    /// Existence filter
    pub filter: FilterConfig,
    /// Admission keys
    pub admission: AdmissionConfig,
    /// Order stream
    pub stream: StreamConfig,
    /// Backend timeouts
    pub backend: BackendConfig,
    /// Background pool
    pub background: BackgroundConfig,
    /// Id generator
    pub ids: IdConfig,
}

impl HotpathConfig {
    /// Defaults overlaid with `HOTPATH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values produced by `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let source = Source { lookup: &lookup };

        if let Some(secs) = source.parse::<u64>("HOTPATH_CACHE_LOGICAL_TTL_SECS")? {
            config.cache.logical_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = source.parse::<u64>("HOTPATH_CACHE_JITTER_SECS")? {
            config.cache.logical_jitter = Duration::from_secs(secs);
        }
        if let Some(secs) = source.parse::<u64>("HOTPATH_CACHE_PHYSICAL_TTL_SECS")? {
            config.cache.physical_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = source.parse::<u64>("HOTPATH_LOCK_LEASE_MS")? {
            config.lock.lease = Duration::from_millis(ms);
        }
        if let Some(ms) = source.parse::<u64>("HOTPATH_LOCK_RETRY_LEASE_MS")? {
            config.lock.retry_lease = Duration::from_millis(ms);
        }
        if let Some(items) = source.validated("HOTPATH_FILTER_EXPECTED_ITEMS", ExpectedItems::try_new)? {
            config.filter.expected_items = items;
        }
        if let Some(rate) =
            source.validated("HOTPATH_FILTER_FALSE_POSITIVE_RATE", FalsePositiveRate::try_new)?
        {
            config.filter.false_positive_rate = rate;
        }
        if let Some(ms) = source.parse::<u64>("HOTPATH_FILTER_MAX_LAG_MS")? {
            config.filter.max_registration_lag = Duration::from_millis(ms);
            config.filter.registration_retry.max_total = Duration::from_millis(ms);
        }
        if let Some(key) = source.raw("HOTPATH_STREAM_KEY") {
            config.stream.stream_key = key;
        }
        if let Some(group) = source.raw("HOTPATH_STREAM_GROUP") {
            config.stream.group = group;
        }
        if let Some(count) = source.validated("HOTPATH_STREAM_CONSUMERS", ConsumerCount::try_new)? {
            config.stream.consumers = count;
        }
        if let Some(size) = source.validated("HOTPATH_STREAM_BATCH_SIZE", BatchSize::try_new)? {
            config.stream.batch_size = size;
        }
        if let Some(ms) = source.parse::<u64>("HOTPATH_BACKEND_TIMEOUT_MS")? {
            config.backend.call_timeout = Duration::from_millis(ms);
        }
        if let Some(workers) = source.validated("HOTPATH_BACKGROUND_WORKERS", WorkerCount::try_new)? {
            config.background.workers = workers;
        }

        config.validate()?;
        Ok(config)
    }

    /// Cross-section consistency checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.logical_floor > self.cache.logical_ttl {
            return Err(ConfigError::Inconsistent(
                "cache logical floor exceeds the logical TTL".to_string(),
            ));
        }
        if self.cache.physical_ttl <= self.cache.logical_ttl + self.cache.logical_jitter {
            return Err(ConfigError::Inconsistent(
                "physical TTL must outlive the longest jittered logical TTL".to_string(),
            ));
        }
        if self.lock.lease.is_zero() || self.lock.retry_lease.is_zero() {
            return Err(ConfigError::Inconsistent(
                "lock leases must be non-zero".to_string(),
            ));
        }
        if self.lock.retry_lease > self.lock.lease {
            return Err(ConfigError::Inconsistent(
                "retry lease must not exceed the primary lease".to_string(),
            ));
        }
        if self.lock.poll.total_wait() >= self.lock.lease {
            return Err(ConfigError::Inconsistent(
                "lock polling must finish within one lease".to_string(),
            ));
        }
        if self.backend.call_timeout.is_zero() {
            return Err(ConfigError::Inconsistent(
                "backend call timeout must be non-zero".to_string(),
            ));
        }
        if self.background.queue_capacity == 0 {
            return Err(ConfigError::Inconsistent(
                "background queue capacity must be non-zero".to_string(),
            ));
        }
        if self.ids.sequence_bits == 0 || self.ids.sequence_bits >= 64 {
            return Err(ConfigError::Inconsistent(
                "id sequence bits must be between 1 and 63".to_string(),
            ));
        }
        Ok(())
    }
}

struct Source<'a, F> {
    lookup: &'a F,
}

impl<F> Source<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|value| !value.trim().is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.raw(name)
            .map(|value| {
                value.trim().parse().map_err(|error: T::Err| ConfigError::InvalidVar {
                    name: name.to_string(),
                    value: value.clone(),
                    reason: error.to_string(),
                })
            })
            .transpose()
    }

    fn validated<R, T, E>(
        &self,
        name: &str,
        construct: impl FnOnce(R) -> Result<T, E>,
    ) -> Result<Option<T>, ConfigError>
    where
        R: FromStr,
        R::Err: std::fmt::Display,
        E: std::fmt::Display,
    {
        let Some(raw) = self.parse::<R>(name)? else {
            return Ok(None);
        };
        construct(raw).map(Some).map_err(|error| ConfigError::InvalidVar {
            name: name.to_string(),
            value: self.raw(name).unwrap_or_default(),
            reason: error.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_carry_production_constants() {
        let config = HotpathConfig::default();
        assert_eq!(config.cache.logical_ttl, Duration::from_secs(1800));
        assert_eq!(config.cache.physical_ttl, Duration::from_secs(86_400));
        assert_eq!(config.lock.lease, Duration::from_secs(5));
        assert_eq!(config.lock.retry_lease, Duration::from_secs(3));
        assert_eq!(config.stream.stream_key, "stream.orders");
        assert_eq!(config.stream.group, "order-group");
        assert_eq!(usize::from(config.stream.consumers), 3);
        assert_eq!(usize::from(config.stream.batch_size), 10);
        assert_eq!(config.backend.call_timeout, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = HotpathConfig::from_lookup(lookup(&[
            ("HOTPATH_STREAM_CONSUMERS", "5"),
            ("HOTPATH_STREAM_KEY", "stream.test"),
            ("HOTPATH_LOCK_LEASE_MS", "8000"),
            ("HOTPATH_FILTER_FALSE_POSITIVE_RATE", "0.001"),
        ]))
        .unwrap();

        assert_eq!(usize::from(config.stream.consumers), 5);
        assert_eq!(config.stream.stream_key, "stream.test");
        assert_eq!(config.lock.lease, Duration::from_secs(8));
        assert!((f64::from(config.filter.false_positive_rate) - 0.001).abs() < f64::EPSILON);
    }

    #[test]
    fn unparsable_variable_is_reported() {
        let error = HotpathConfig::from_lookup(lookup(&[("HOTPATH_LOCK_LEASE_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(error, ConfigError::InvalidVar { ref name, .. } if name == "HOTPATH_LOCK_LEASE_MS"));
    }

    #[test]
    fn out_of_range_variable_is_reported() {
        let error = HotpathConfig::from_lookup(lookup(&[("HOTPATH_STREAM_CONSUMERS", "0")]))
            .unwrap_err();
        assert!(matches!(error, ConfigError::InvalidVar { ref value, .. } if value == "0"));
    }

    #[test]
    fn physical_ttl_must_outlive_logical_ttl() {
        let error = HotpathConfig::from_lookup(lookup(&[(
            "HOTPATH_CACHE_PHYSICAL_TTL_SECS",
            "60",
        )]))
        .unwrap_err();
        assert!(matches!(error, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn retry_lease_cannot_exceed_lease() {
        let mut config = HotpathConfig::default();
        config.lock.retry_lease = Duration::from_secs(10);
        assert!(config.validate().is_err());
    }
}
