//! Minimal backend doubles for unit tests inside this crate.
//!
//! Scenario tests use the full reference backend from `hotpath-memory`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{BitmapStore, KeyValueStore};
use crate::clock::{Clock, ManualClock};
use crate::errors::{BackendError, BackendResult, StoreResult};
use crate::store::{NewShop, Shop, ShopRepository};
use crate::types::{ShopId, Timestamp};

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, (String, Option<Timestamp>)>,
    bits: HashMap<String, HashSet<u64>>,
}

/// Key-value and bitmap double with expiry on a manual clock and failure injection.
#[derive(Debug, Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<State>>,
    pub clock: ManualClock,
    failing: Arc<AtomicBool>,
    failing_writes: Arc<AtomicBool>,
    pub calls: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            clock: ManualClock::default(),
            failing: Arc::default(),
            failing_writes: Arc::default(),
            calls: Arc::default(),
        }
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes only `set_with_ttl` fail.
    pub fn fail_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }

    pub fn raw_put(&self, key: &str, value: &str) {
        self.state
            .lock()
            .values
            .insert(key.to_string(), (value.to_string(), None));
    }

    fn check(&self) -> BackendResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(BackendError::Unavailable("injected".to_string()))
        } else {
            Ok(())
        }
    }

    fn live(&self, state: &mut State, key: &str) -> Option<String> {
        let now = self.clock.now();
        match state.values.get(key) {
            Some((_, Some(expires))) if *expires <= now => {
                state.values.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl KeyValueStore for FakeBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.check()?;
        let mut state = self.state.lock();
        Ok(self.live(&mut state, key))
    }

    async fn set(&self, key: &str, value: &str) -> BackendResult<()> {
        self.check()?;
        self.raw_put(key, value);
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<()> {
        self.check()?;
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("injected write failure".to_string()));
        }
        let expires = self.clock.now().saturating_add(ttl);
        self.state
            .lock()
            .values
            .insert(key.to_string(), (value.to_string(), Some(expires)));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        if self.live(&mut state, key).is_some() {
            return Ok(false);
        }
        let expires = self.clock.now().saturating_add(ttl);
        state
            .values
            .insert(key.to_string(), (value.to_string(), Some(expires)));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> BackendResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        if self.live(&mut state, key).as_deref() == Some(expected) {
            state.values.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        let existed = self.live(&mut state, key).is_some();
        state.values.remove(key);
        Ok(existed)
    }

    async fn increment(&self, key: &str) -> BackendResult<u64> {
        self.check()?;
        let mut state = self.state.lock();
        let current = self
            .live(&mut state, key)
            .map_or(Ok(0), |v| v.parse::<u64>())
            .map_err(|e| BackendError::Corrupt {
                key: key.to_string(),
                detail: e.to_string(),
            })?;
        let next = current + 1;
        state
            .values
            .insert(key.to_string(), (next.to_string(), None));
        Ok(next)
    }
}

#[async_trait]
impl BitmapStore for FakeBackend {
    async fn set_bits(&self, key: &str, offsets: &[u64]) -> BackendResult<()> {
        self.check()?;
        self.state
            .lock()
            .bits
            .entry(key.to_string())
            .or_default()
            .extend(offsets.iter().copied());
        Ok(())
    }

    async fn get_bits(&self, key: &str, offsets: &[u64]) -> BackendResult<Vec<bool>> {
        self.check()?;
        let state = self.state.lock();
        let bits = state.bits.get(key);
        Ok(offsets
            .iter()
            .map(|offset| bits.is_some_and(|set| set.contains(offset)))
            .collect())
    }
}

/// Shop repository double counting reads.
#[derive(Debug, Default)]
pub struct FakeShops {
    rows: Mutex<HashMap<ShopId, Shop>>,
    pub reads: AtomicUsize,
    pub latency: Duration,
}

impl FakeShops {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn put(&self, shop: Shop) {
        self.rows.lock().insert(shop.id, shop);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

pub fn sample_shop(id: u64) -> Shop {
    let now = Timestamp::now();
    Shop {
        id: ShopId::new(id),
        name: format!("shop {id}"),
        type_id: 1,
        images: String::new(),
        area: "downtown".to_string(),
        address: "1 Main St".to_string(),
        x: 120.1,
        y: 30.2,
        avg_price: 80,
        sold: 0,
        comments: 0,
        score: 45,
        open_hours: "10:00-22:00".to_string(),
        create_time: now,
        update_time: now,
    }
}

#[async_trait]
impl ShopRepository for FakeShops {
    async fn find_shop(&self, id: ShopId) -> StoreResult<Option<Shop>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self.rows.lock().get(&id).cloned())
    }

    async fn insert_shop(&self, shop: NewShop) -> StoreResult<Shop> {
        let mut rows = self.rows.lock();
        let id = rows.keys().map(|id| u64::from(*id)).max().unwrap_or(0) + 1;
        let mut row = sample_shop(id);
        row.name = shop.name;
        row.type_id = shop.type_id;
        row.address = shop.address;
        rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_shop(&self, shop: &Shop) -> StoreResult<bool> {
        let mut rows = self.rows.lock();
        match rows.get_mut(&shop.id) {
            Some(row) => {
                *row = shop.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn all_ids(&self) -> StoreResult<Vec<ShopId>> {
        Ok(self.rows.lock().keys().copied().collect())
    }
}
