//! Cross-process mutual exclusion over a named key.
//!
//! Acquisition is one atomic set-if-absent with a lease; release is one
//! atomic compare-and-delete against the holder's random token. Neither call
//! blocks waiting for the lock: callers that need to wait bring their own
//! backoff. A release whose token no longer matches (the lease expired and
//! someone else acquired) is a logged no-op.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::KeyValueStore;
use crate::clock::Clock;
use crate::errors::BackendResult;
use crate::timeout::bounded;
use crate::types::Timestamp;

/// Proof of a granted acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    key: String,
    token: String,
    expires_at: Timestamp,
}

impl LockLease {
    /// Locked key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner token stored under the key.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the backend drops the key if it is not released.
    pub const fn expires_at(&self) -> Timestamp {
        self.expires_at
    }
}

/// Result of a single acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// The lock is ours until the lease expires.
    Granted(LockLease),
    /// Someone else holds the lock.
    Contended,
}

impl Acquisition {
    /// Whether the lock was granted.
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Lease-based lock on the shared key-value backend.
#[derive(Clone)]
pub struct DistributedMutex {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
}

impl std::fmt::Debug for DistributedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedMutex")
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl DistributedMutex {
    /// Creates a mutex over `kv`.
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, call_timeout: Duration) -> Self {
        Self {
            kv,
            clock,
            call_timeout,
        }
    }

    /// Tries once to take `key` for `lease`.
    pub async fn acquire(&self, key: &str, lease: Duration) -> BackendResult<Acquisition> {
        let token = Uuid::new_v4().to_string();
        let granted = bounded(self.call_timeout, self.kv.set_if_absent(key, &token, lease)).await?;
        if !granted {
            debug!(key, "lock contended");
            return Ok(Acquisition::Contended);
        }
        debug!(key, ?lease, "lock granted");
        Ok(Acquisition::Granted(LockLease {
            key: key.to_string(),
            token,
            expires_at: self.clock.now().saturating_add(lease),
        }))
    }

    /// Releases a lease. Returns `false` if the lease was no longer ours.
    pub async fn release(&self, lease: &LockLease) -> BackendResult<bool> {
        self.release_token(&lease.key, &lease.token).await
    }

    /// Deletes `key` only while it still holds `token`.
    pub async fn release_token(&self, key: &str, token: &str) -> BackendResult<bool> {
        let released =
            bounded(self.call_timeout, self.kv.compare_and_delete(key, token)).await?;
        if !released {
            warn!(key, "lock release skipped, token no longer matches");
        }
        Ok(released)
    }

    /// Releases a lease and logs instead of failing.
    ///
    /// For cleanup paths: the lease expires on its own if the release call fails.
    pub async fn release_quietly(&self, lease: &LockLease) {
        if let Err(e) = self.release(lease).await {
            warn!(key = %lease.key, error = %e, "lock release failed, lease will expire");
        }
    }
}
