//! Connection pool settings.

use std::num::NonZeroU32;
use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::retry::RetryStrategy;

/// Maximum number of database connections in the pool.
///
/// At least one, enforced by the `NonZeroU32` inner type.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into, Serialize, Deserialize))]
pub struct MaxConnections(NonZeroU32);

/// Pool and retry configuration of [`PostgresStore`](crate::PostgresStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 3 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
    /// Retries of idempotent reads and of transaction start
    pub retry: RetryStrategy,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: NonZeroU32 = match NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            retry: RetryStrategy::default(),
        }
    }
}

impl PostgresConfig {
    /// Overrides the pool size from `HOTPATH_POSTGRES_MAX_CONNECTIONS` when set and valid.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(max) = std::env::var("HOTPATH_POSTGRES_MAX_CONNECTIONS")
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .and_then(NonZeroU32::new)
        {
            self.max_connections = MaxConnections::new(max);
        }
        self
    }
}
