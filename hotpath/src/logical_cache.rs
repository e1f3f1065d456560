//! Cache entries with an application-level staleness timestamp.
//!
//! An entry is stored with a long physical TTL and carries its own
//! `logical_expire_at`. Reading never turns a stale entry into a miss: the
//! caller gets the payload together with `is_fresh` and decides whether to
//! schedule a rebuild.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backend::KeyValueStore;
use crate::clock::Clock;
use crate::errors::{BackendError, BackendResult};
use crate::timeout::bounded;
use crate::types::Timestamp;

/// Stored form of a cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<V> {
    /// Cached value
    pub payload: V,
    /// Instant after which the entry is stale
    pub logical_expire_at: Timestamp,
}

impl<V> CacheEntry<V> {
    /// Whether the entry is fresh at `now`.
    pub fn is_fresh_at(&self, now: Timestamp) -> bool {
        now < self.logical_expire_at
    }
}

/// A found entry and its freshness at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<V> {
    /// The stored entry
    pub entry: CacheEntry<V>,
    /// `now < entry.logical_expire_at`
    pub is_fresh: bool,
}

impl<V> CacheRead<V> {
    /// Takes the payload out.
    pub fn into_payload(self) -> V {
        self.entry.payload
    }
}

/// `base` shifted by a uniform offset in `[-jitter, +jitter]`, never below `floor`.
///
/// Spreads expiry of entries filled at the same moment.
pub fn jittered_ttl(base: Duration, jitter: Duration, floor: Duration) -> Duration {
    jittered_ttl_with(&mut rand::rng(), base, jitter, floor)
}

/// [`jittered_ttl`] with a caller-supplied random source.
pub fn jittered_ttl_with<R: Rng>(
    rng: &mut R,
    base: Duration,
    jitter: Duration,
    floor: Duration,
) -> Duration {
    let spread = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX / 2);
    let offset = rng.random_range(0..=spread.saturating_mul(2));
    let ttl = if offset >= spread {
        base.saturating_add(Duration::from_millis(offset - spread))
    } else {
        base.saturating_sub(Duration::from_millis(spread - offset))
    };
    ttl.max(floor)
}

/// Typed view over logically-expiring entries in the key-value backend.
pub struct LogicalExpiryCache<V> {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    _payload: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for LogicalExpiryCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalExpiryCache")
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl<V> LogicalExpiryCache<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Creates a cache over `kv`.
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, call_timeout: Duration) -> Self {
        Self {
            kv,
            clock,
            call_timeout,
            _payload: PhantomData,
        }
    }

    /// Reads `key`. `None` is a true miss; a stale entry is still returned.
    pub async fn read(&self, key: &str) -> BackendResult<Option<CacheRead<V>>> {
        let Some(raw) = bounded(self.call_timeout, self.kv.get(key)).await? else {
            return Ok(None);
        };
        let entry: CacheEntry<V> =
            serde_json::from_str(&raw).map_err(|e| BackendError::Corrupt {
                key: key.to_string(),
                detail: e.to_string(),
            })?;
        let is_fresh = entry.is_fresh_at(self.clock.now());
        Ok(Some(CacheRead { entry, is_fresh }))
    }

    /// Stores `payload` fresh for `logical_ttl` and physically kept for `physical_ttl`.
    ///
    /// Returns the logical expiry written.
    pub async fn write(
        &self,
        key: &str,
        payload: &V,
        logical_ttl: Duration,
        physical_ttl: Duration,
    ) -> BackendResult<Timestamp> {
        let logical_expire_at = self.clock.now().saturating_add(logical_ttl);
        let raw = serde_json::to_string(&CacheEntry {
            payload,
            logical_expire_at,
        })
        .map_err(|e| BackendError::Corrupt {
            key: key.to_string(),
            detail: e.to_string(),
        })?;
        bounded(
            self.call_timeout,
            self.kv.set_with_ttl(key, &raw, physical_ttl),
        )
        .await?;
        Ok(logical_expire_at)
    }

    /// Removes `key`.
    pub async fn invalidate(&self, key: &str) -> BackendResult<bool> {
        bounded(self.call_timeout, self.kv.delete(key)).await
    }
}
