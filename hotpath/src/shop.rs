//! Stampede- and penetration-safe shop reads.
//!
//! `get_by_id` layers four defenses:
//!
//! 1. the existence filter answers "never registered" without touching the
//!    cache or the store;
//! 2. a logically-expiring cache entry is served even when stale, with a
//!    background rebuild scheduled for stale entries;
//! 3. concurrent misses in this process share one rebuild through the
//!    coalescer;
//! 4. across processes only the holder of `lock:shop:{id}` reads the store and
//!    writes the entry. Everyone else polls the cache with bounded backoff,
//!    tries once more with a shorter lease, and then answers `Busy`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::background::{BackgroundPool, JobError};
use crate::config::{CacheConfig, HotpathConfig, LockConfig};
use crate::coalesce::CallCoalescer;
use crate::errors::{BackendError, ShopError, ShopResult};
use crate::existence::ExistenceFilter;
use crate::logical_cache::{jittered_ttl, CacheRead, LogicalExpiryCache};
use crate::mutex::{Acquisition, DistributedMutex, LockLease};
use crate::store::{NewShop, Shop, ShopRepository};
use crate::timeout::bounded;
use crate::types::{EntityKind, ShopId};

struct Inner {
    filter: Arc<ExistenceFilter>,
    cache: LogicalExpiryCache<Shop>,
    coalescer: CallCoalescer<Shop, ShopError>,
    mutex: DistributedMutex,
    shops: Arc<dyn ShopRepository>,
    pool: Arc<BackgroundPool>,
    cache_config: CacheConfig,
    lock_config: LockConfig,
    store_timeout: Duration,
}

/// Read path for shops. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ShopCacheOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ShopCacheOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShopCacheOrchestrator")
            .field("cache_prefix", &self.inner.cache_config.key_prefix)
            .field("in_flight", &self.inner.coalescer.in_flight())
            .finish_non_exhaustive()
    }
}

impl ShopCacheOrchestrator {
    /// Wires the orchestrator from its components.
    pub fn new(
        filter: Arc<ExistenceFilter>,
        cache: LogicalExpiryCache<Shop>,
        mutex: DistributedMutex,
        shops: Arc<dyn ShopRepository>,
        pool: Arc<BackgroundPool>,
        config: &HotpathConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                filter,
                cache,
                coalescer: CallCoalescer::new(),
                mutex,
                shops,
                pool,
                cache_config: config.cache.clone(),
                lock_config: config.lock.clone(),
                store_timeout: config.backend.call_timeout,
            }),
        }
    }

    fn cache_key(&self, id: ShopId) -> String {
        format!("{}{id}", self.inner.cache_config.key_prefix)
    }

    fn lock_key(&self, id: ShopId) -> String {
        format!("{}{id}", self.inner.lock_config.key_prefix)
    }

    fn rebuild_lock_key(&self, id: ShopId) -> String {
        format!("{}{id}", self.inner.lock_config.rebuild_key_prefix)
    }

    /// Returns the shop, `NotFound`, or `Busy` when another instance is rebuilding.
    #[instrument(skip(self), fields(shop_id = %id))]
    pub async fn get_by_id(&self, id: ShopId) -> ShopResult<Shop> {
        if !self
            .inner
            .filter
            .might_exist(EntityKind::Shop, id.into())
            .await
        {
            debug!("rejected by existence filter");
            return Err(ShopError::NotFound(id));
        }

        let key = self.cache_key(id);
        if let Some(read) = self.peek(&key).await? {
            return Ok(self.serve(id, read));
        }

        debug!("cache miss");
        self.inner
            .coalescer
            .run(&key, || self.rebuild_on_miss(id, &key))
            .await
    }

    /// Reads the cache, treating an undecodable entry as a miss.
    async fn peek(&self, key: &str) -> ShopResult<Option<CacheRead<Shop>>> {
        match self.inner.cache.read(key).await {
            Ok(read) => Ok(read),
            Err(BackendError::Corrupt { key, detail }) => {
                warn!(%key, %detail, "undecodable cache entry, treating as miss");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn serve(&self, id: ShopId, read: CacheRead<Shop>) -> Shop {
        if read.is_fresh {
            debug!("cache hit");
        } else {
            debug!("stale cache hit, scheduling rebuild");
            self.schedule_rebuild(id);
        }
        read.into_payload()
    }

    async fn rebuild_on_miss(&self, id: ShopId, key: &str) -> ShopResult<Shop> {
        // Another process may have filled the entry while we queued.
        if let Some(read) = self.peek(key).await? {
            return Ok(self.serve(id, read));
        }

        let lock_key = self.lock_key(id);
        let lock = &self.inner.lock_config;
        if let Acquisition::Granted(lease) = self.inner.mutex.acquire(&lock_key, lock.lease).await? {
            return self.load_and_fill(id, key, &lease).await;
        }

        for delay in lock.poll.schedule() {
            tokio::time::sleep(delay).await;
            if let Some(read) = self.peek(key).await? {
                debug!(?delay, "entry appeared while polling");
                return Ok(read.into_payload());
            }
        }

        match self.inner.mutex.acquire(&lock_key, lock.retry_lease).await? {
            Acquisition::Granted(lease) => self.load_and_fill(id, key, &lease).await,
            Acquisition::Contended => match self.peek(key).await? {
                Some(read) => Ok(read.into_payload()),
                None => {
                    info!("rebuild lock still contended, answering busy");
                    Err(ShopError::Busy(id))
                }
            },
        }
    }

    async fn load_and_fill(&self, id: ShopId, key: &str, lease: &LockLease) -> ShopResult<Shop> {
        let result = self.fill(id, key).await;
        self.inner.mutex.release_quietly(lease).await;
        result
    }

    /// Store read plus cache write. Must run under `lock:shop:{id}`.
    async fn fill(&self, id: ShopId, key: &str) -> ShopResult<Shop> {
        let shop = bounded(self.inner.store_timeout, self.inner.shops.find_shop(id))
            .await?
            .ok_or(ShopError::NotFound(id))?;

        let cache = &self.inner.cache_config;
        let logical_ttl = jittered_ttl(cache.logical_ttl, cache.logical_jitter, cache.logical_floor);
        match self
            .inner
            .cache
            .write(key, &shop, logical_ttl, cache.physical_ttl)
            .await
        {
            Ok(expires) => debug!(%expires, "cache entry rebuilt"),
            Err(e) => warn!(error = %e, "cache write after store read failed, serving uncached"),
        }
        Ok(shop)
    }

    /// Queues a stale-entry rebuild. Returns whether the pool accepted it.
    pub fn schedule_rebuild(&self, id: ShopId) -> bool {
        let orchestrator = self.clone();
        self.inner
            .pool
            .try_submit(format!("rebuild shop {id}"), async move {
                orchestrator
                    .rebuild_stale(id)
                    .await
                    .map_err(|e| -> JobError { Box::new(e) })
            })
    }

    async fn rebuild_stale(&self, id: ShopId) -> ShopResult<()> {
        let rebuild_key = self.rebuild_lock_key(id);
        let lease = self.inner.lock_config.lease;
        let Acquisition::Granted(rebuild) = self.inner.mutex.acquire(&rebuild_key, lease).await?
        else {
            debug!(shop_id = %id, "stale rebuild already running elsewhere");
            return Ok(());
        };

        let result = match self.inner.mutex.acquire(&self.lock_key(id), lease).await {
            Ok(Acquisition::Granted(fill)) => self
                .load_and_fill(id, &self.cache_key(id), &fill)
                .await
                .map(|_| ()),
            Ok(Acquisition::Contended) => {
                debug!(shop_id = %id, "miss-path rebuild in progress, skipping");
                Ok(())
            }
            Err(e) => Err(e.into()),
        };
        self.inner.mutex.release_quietly(&rebuild).await;
        result
    }

    /// Updates the row, then drops the cache entry.
    ///
    /// A failed cache delete is logged only; the entry self-heals on expiry.
    #[instrument(skip(self, shop), fields(shop_id = %shop.id))]
    pub async fn update(&self, shop: &Shop) -> ShopResult<()> {
        let updated = bounded(self.inner.store_timeout, self.inner.shops.update_shop(shop)).await?;
        if !updated {
            return Err(ShopError::NotFound(shop.id));
        }
        if let Err(e) = self.inner.cache.invalidate(&self.cache_key(shop.id)).await {
            warn!(error = %e, "cache invalidation after update failed");
        }
        Ok(())
    }

    /// Inserts a shop and registers its id in the existence filter in the background.
    #[instrument(skip(self, shop))]
    pub async fn create(&self, shop: NewShop) -> ShopResult<Shop> {
        let created = bounded(self.inner.store_timeout, self.inner.shops.insert_shop(shop)).await?;
        self.inner
            .filter
            .register_in_background(&self.inner.pool, EntityKind::Shop, created.id.into());
        info!(shop_id = %created.id, "shop created");
        Ok(created)
    }

    /// Registers every stored shop id in the existence filter.
    #[instrument(skip(self))]
    pub async fn warm_up(&self) -> ShopResult<usize> {
        let ids = bounded(self.inner.store_timeout, self.inner.shops.all_ids()).await?;
        let registered = self
            .inner
            .filter
            .warm_up(EntityKind::Shop, ids.into_iter().map(u64::from))
            .await?;
        info!(registered, "shop existence filter warmed up");
        Ok(registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_shop, FakeBackend, FakeShops};
    use tracing_test::traced_test;

    struct Fixture {
        backend: FakeBackend,
        shops: Arc<FakeShops>,
        filter: Arc<ExistenceFilter>,
        pool: Arc<BackgroundPool>,
        orchestrator: ShopCacheOrchestrator,
    }

    fn fixture(shops: FakeShops) -> Fixture {
        let backend = FakeBackend::new();
        let config = HotpathConfig::default();
        let clock = Arc::new(backend.clock.clone());
        let kv = Arc::new(backend.clone());
        let filter = Arc::new(ExistenceFilter::new(
            kv.clone(),
            clock.clone(),
            &config.filter,
            config.backend.call_timeout,
        ));
        let shops = Arc::new(shops);
        let pool = Arc::new(BackgroundPool::new(2, 16));
        let orchestrator = ShopCacheOrchestrator::new(
            Arc::clone(&filter),
            LogicalExpiryCache::new(kv.clone(), clock.clone(), config.backend.call_timeout),
            DistributedMutex::new(kv, clock, config.backend.call_timeout),
            shops.clone(),
            Arc::clone(&pool),
            &config,
        );
        Fixture {
            backend,
            shops,
            filter,
            pool,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn unknown_id_is_not_found_without_store_read() {
        let fx = fixture(FakeShops::default());

        let result = fx.orchestrator.get_by_id(ShopId::new(42)).await;

        assert_eq!(result, Err(ShopError::NotFound(ShopId::new(42))));
        assert_eq!(fx.shops.reads(), 0);
    }

    #[tokio::test]
    async fn miss_fills_cache_and_next_read_hits() {
        let fx = fixture(FakeShops::default());
        fx.shops.put(sample_shop(1));
        fx.filter.register(EntityKind::Shop, 1).await.unwrap();

        let first = fx.orchestrator.get_by_id(ShopId::new(1)).await.unwrap();
        let second = fx.orchestrator.get_by_id(ShopId::new(1)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fx.shops.reads(), 1);
    }

    #[tokio::test]
    async fn false_positive_id_missing_from_store_is_not_found() {
        let fx = fixture(FakeShops::default());
        fx.filter.register(EntityKind::Shop, 5).await.unwrap();

        let result = fx.orchestrator.get_by_id(ShopId::new(5)).await;

        assert_eq!(result, Err(ShopError::NotFound(ShopId::new(5))));
        assert_eq!(fx.shops.reads(), 1);
    }

    #[tokio::test]
    async fn stale_entry_is_served_and_rebuilt_in_background() {
        let fx = fixture(FakeShops::default());
        fx.shops.put(sample_shop(3));
        fx.filter.register(EntityKind::Shop, 3).await.unwrap();
        fx.orchestrator.get_by_id(ShopId::new(3)).await.unwrap();

        let mut renamed = sample_shop(3);
        renamed.name = "renamed".to_string();
        fx.shops.put(renamed);
        fx.backend.clock.advance(Duration::from_secs(40 * 60));

        let stale = fx.orchestrator.get_by_id(ShopId::new(3)).await.unwrap();
        assert_eq!(stale.name, "shop 3");

        fx.pool.wait_idle().await;
        let fresh = fx.orchestrator.get_by_id(ShopId::new(3)).await.unwrap();
        assert_eq!(fresh.name, "renamed");
        assert_eq!(fx.shops.reads(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn contended_lock_without_entry_answers_busy() {
        let fx = fixture(FakeShops::default());
        fx.shops.put(sample_shop(8));
        fx.filter.register(EntityKind::Shop, 8).await.unwrap();

        let foreign = DistributedMutex::new(
            Arc::new(fx.backend.clone()),
            Arc::new(fx.backend.clock.clone()),
            Duration::from_secs(3),
        );
        assert!(foreign
            .acquire("lock:shop:8", Duration::from_secs(5))
            .await
            .unwrap()
            .is_granted());

        let result = fx.orchestrator.get_by_id(ShopId::new(8)).await;

        assert_eq!(result, Err(ShopError::Busy(ShopId::new(8))));
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(fx.shops.reads(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn cache_write_failure_is_logged_and_request_succeeds() {
        let fx = fixture(FakeShops::default());
        fx.shops.put(sample_shop(4));
        fx.filter.register(EntityKind::Shop, 4).await.unwrap();
        fx.backend.fail_writes(true);

        let shop = fx.orchestrator.get_by_id(ShopId::new(4)).await.unwrap();

        assert_eq!(shop.id, ShopId::new(4));
        assert!(logs_contain("cache write after store read failed"));
    }

    #[tokio::test]
    async fn update_invalidates_cached_entry() {
        let fx = fixture(FakeShops::default());
        fx.shops.put(sample_shop(6));
        fx.filter.register(EntityKind::Shop, 6).await.unwrap();
        fx.orchestrator.get_by_id(ShopId::new(6)).await.unwrap();

        let mut changed = sample_shop(6);
        changed.name = "changed".to_string();
        fx.orchestrator.update(&changed).await.unwrap();

        let read = fx.orchestrator.get_by_id(ShopId::new(6)).await.unwrap();
        assert_eq!(read.name, "changed");
        assert_eq!(fx.shops.reads(), 2);
    }

    #[tokio::test]
    async fn created_shop_is_readable_immediately() {
        let fx = fixture(FakeShops::default());

        let created = fx
            .orchestrator
            .create(NewShop {
                name: "new".to_string(),
                type_id: 2,
                images: String::new(),
                area: "north".to_string(),
                address: "2 Side St".to_string(),
                x: 0.0,
                y: 0.0,
                avg_price: 10,
                open_hours: "09:00-18:00".to_string(),
            })
            .await
            .unwrap();

        let read = fx.orchestrator.get_by_id(created.id).await.unwrap();
        assert_eq!(read.name, "new");
        fx.pool.wait_idle().await;
        assert!(fx.filter.might_exist(EntityKind::Shop, created.id.into()).await);
    }

    #[tokio::test]
    async fn warm_up_registers_stored_ids() {
        let fx = fixture(FakeShops::default());
        for id in 1..=3 {
            fx.shops.put(sample_shop(id));
        }

        assert_eq!(fx.orchestrator.warm_up().await.unwrap(), 3);
        for id in 1..=3 {
            assert!(fx.filter.might_exist(EntityKind::Shop, id).await);
        }
    }

    #[tokio::test]
    async fn concurrent_misses_read_store_once() {
        let fx = fixture(FakeShops::with_latency(Duration::from_millis(50)));
        fx.shops.put(sample_shop(9));
        fx.filter.register(EntityKind::Shop, 9).await.unwrap();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let orchestrator = fx.orchestrator.clone();
                tokio::spawn(async move { orchestrator.get_by_id(ShopId::new(9)).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().id, ShopId::new(9));
        }
        assert_eq!(fx.shops.reads(), 1);
    }
}
