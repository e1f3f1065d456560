//! Shared cache/coordination backend held in process memory.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hotpath::backend::{AdmissionBackend, AdmissionRequest, BitmapStore, KeyValueStore};
use hotpath::clock::{Clock, SystemClock};
use hotpath::errors::{BackendError, BackendResult};
use hotpath::types::{MessageId, Timestamp};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::stream::Stream;

#[derive(Debug)]
struct Value {
    data: String,
    expires_at: Option<Timestamp>,
}

#[derive(Debug, Default)]
pub(crate) struct State {
    values: HashMap<String, Value>,
    bitmaps: HashMap<String, HashSet<u64>>,
    sets: HashMap<String, HashSet<String>>,
    pub(crate) streams: HashMap<String, Stream>,
}

impl State {
    fn live(&mut self, key: &str, now: Timestamp) -> Option<&mut Value> {
        let expired = self
            .values
            .get(key)
            .and_then(|v| v.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.values.remove(key);
            return None;
        }
        self.values.get_mut(key)
    }

    pub(crate) fn append(
        &mut self,
        stream: &str,
        fields: BTreeMap<String, String>,
        now: Timestamp,
    ) -> MessageId {
        self.streams
            .entry(stream.to_string())
            .or_default()
            .append(fields, now.unix_millis())
    }
}

pub(crate) struct Inner {
    pub(crate) state: Mutex<State>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) appended: Notify,
    unavailable: AtomicBool,
}

/// In-process implementation of every cache/coordination contract.
///
/// One lock guards the whole keyspace, so each call (the admission
/// evaluation included) is atomic with respect to every other call.
/// Clones share state.
#[derive(Clone)]
pub struct InMemoryBackend {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("clock", &self.inner.clock)
            .finish_non_exhaustive()
    }
}

impl InMemoryBackend {
    /// Backend on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Backend whose expiries follow `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                clock,
                appended: Notify::new(),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Simulates an outage: every call fails with `Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remaining time to live of `key`, `None` when absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        state
            .live(key, now)
            .and_then(|v| v.expires_at)
            .map(|at| at.duration_since(now))
    }

    /// Members of the set at `key`.
    pub fn set_members(&self, key: &str) -> HashSet<String> {
        self.inner
            .state
            .lock()
            .sets
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn check(&self) -> BackendResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(
                "in-memory backend marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let now = self.now();
        self.inner.state.lock().values.insert(
            key.to_string(),
            Value {
                data: value.to_string(),
                expires_at: ttl.map(|ttl| now.saturating_add(ttl)),
            },
        );
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.check()?;
        let now = self.now();
        Ok(self
            .inner
            .state
            .lock()
            .live(key, now)
            .map(|v| v.data.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> BackendResult<()> {
        self.check()?;
        self.put(key, value, None);
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<()> {
        self.check()?;
        self.put(key, value, Some(ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<bool> {
        self.check()?;
        let now = self.now();
        let mut state = self.inner.state.lock();
        if state.live(key, now).is_some() {
            return Ok(false);
        }
        state.values.insert(
            key.to_string(),
            Value {
                data: value.to_string(),
                expires_at: Some(now.saturating_add(ttl)),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> BackendResult<bool> {
        self.check()?;
        let now = self.now();
        let mut state = self.inner.state.lock();
        let matches = state.live(key, now).is_some_and(|v| v.data == expected);
        if matches {
            state.values.remove(key);
        }
        Ok(matches)
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        self.check()?;
        let now = self.now();
        let mut state = self.inner.state.lock();
        let present = state.live(key, now).is_some();
        state.values.remove(key);
        Ok(present)
    }

    async fn increment(&self, key: &str) -> BackendResult<u64> {
        self.check()?;
        let now = self.now();
        let mut state = self.inner.state.lock();
        if let Some(value) = state.live(key, now) {
            let current: u64 = value.data.parse().map_err(|_| BackendError::Corrupt {
                key: key.to_string(),
                detail: format!("not a counter: {:?}", value.data),
            })?;
            let next = current + 1;
            value.data = next.to_string();
            return Ok(next);
        }
        state.values.insert(
            key.to_string(),
            Value {
                data: "1".to_string(),
                expires_at: None,
            },
        );
        Ok(1)
    }
}

#[async_trait]
impl BitmapStore for InMemoryBackend {
    async fn set_bits(&self, key: &str, offsets: &[u64]) -> BackendResult<()> {
        self.check()?;
        self.inner
            .state
            .lock()
            .bitmaps
            .entry(key.to_string())
            .or_default()
            .extend(offsets.iter().copied());
        Ok(())
    }

    async fn get_bits(&self, key: &str, offsets: &[u64]) -> BackendResult<Vec<bool>> {
        self.check()?;
        let state = self.inner.state.lock();
        let bits = state.bitmaps.get(key);
        Ok(offsets
            .iter()
            .map(|offset| bits.is_some_and(|b| b.contains(offset)))
            .collect())
    }
}

#[async_trait]
impl AdmissionBackend for InMemoryBackend {
    async fn evaluate_admission(&self, request: &AdmissionRequest) -> BackendResult<i64> {
        self.check()?;
        let now = self.now();
        let reply = {
            let mut state = self.inner.state.lock();
            evaluate(&mut state, request, now)?
        };
        if reply == 0 {
            self.inner.appended.notify_waiters();
        }
        trace!(buyer = %request.buyer, reply, "admission evaluated");
        Ok(reply)
    }
}

/// The admission script body: stock check, duplicate check, then all three writes.
fn evaluate(state: &mut State, request: &AdmissionRequest, now: Timestamp) -> BackendResult<i64> {
    let Some(stock) = state.live(&request.stock_key, now) else {
        return Ok(1);
    };
    let remaining: i64 = stock.data.parse().map_err(|_| BackendError::Corrupt {
        key: request.stock_key.clone(),
        detail: format!("not a stock counter: {:?}", stock.data),
    })?;
    if remaining <= 0 {
        return Ok(1);
    }
    if state
        .sets
        .get(&request.buyers_key)
        .is_some_and(|buyers| buyers.contains(&request.buyer))
    {
        return Ok(2);
    }

    if let Some(stock) = state.live(&request.stock_key, now) {
        stock.data = (remaining - 1).to_string();
    }
    state
        .sets
        .entry(request.buyers_key.clone())
        .or_default()
        .insert(request.buyer.clone());
    state.append(&request.stream_key, request.intent.clone(), now);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotpath::clock::ManualClock;

    fn backend() -> (InMemoryBackend, ManualClock) {
        let clock = ManualClock::default();
        (InMemoryBackend::with_clock(Arc::new(clock.clone())), clock)
    }

    fn request(buyer: &str) -> AdmissionRequest {
        AdmissionRequest {
            stock_key: "seckill:stock:1".to_string(),
            buyers_key: "seckill:order:1".to_string(),
            stream_key: "stream.orders".to_string(),
            buyer: buyer.to_string(),
            intent: BTreeMap::from([("userId".to_string(), buyer.to_string())]),
        }
    }

    #[tokio::test]
    async fn values_expire_on_the_clock() {
        let (backend, clock) = backend();
        backend
            .set_with_ttl("k", "v", Duration::from_secs(10))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(9));
        assert_eq!(backend.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(backend.ttl("k"), Some(Duration::from_secs(1)));

        clock.advance(Duration::from_secs(1));
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_respects_live_values_only() {
        let (backend, clock) = backend();
        let lease = Duration::from_secs(5);

        assert!(backend.set_if_absent("lock", "a", lease).await.unwrap());
        assert!(!backend.set_if_absent("lock", "b", lease).await.unwrap());

        clock.advance(lease);
        assert!(backend.set_if_absent("lock", "b", lease).await.unwrap());
        assert!(!backend.compare_and_delete("lock", "a").await.unwrap());
        assert!(backend.compare_and_delete("lock", "b").await.unwrap());
    }

    #[tokio::test]
    async fn increment_starts_at_one_and_rejects_non_counters() {
        let (backend, _) = backend();
        assert_eq!(backend.increment("n").await.unwrap(), 1);
        assert_eq!(backend.increment("n").await.unwrap(), 2);

        backend.set("s", "text").await.unwrap();
        assert!(matches!(
            backend.increment("s").await,
            Err(BackendError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn bitmap_reports_unset_bits_as_false() {
        let (backend, _) = backend();
        backend.set_bits("bloom:shop", &[3, 9]).await.unwrap();
        assert_eq!(
            backend.get_bits("bloom:shop", &[3, 4, 9]).await.unwrap(),
            vec![true, false, true]
        );
        assert_eq!(
            backend.get_bits("bloom:other", &[3]).await.unwrap(),
            vec![false]
        );
    }

    #[tokio::test]
    async fn admission_checks_stock_before_duplicates() {
        let (backend, _) = backend();
        assert_eq!(backend.evaluate_admission(&request("1")).await.unwrap(), 1);

        backend.set("seckill:stock:1", "1").await.unwrap();
        assert_eq!(backend.evaluate_admission(&request("1")).await.unwrap(), 0);
        assert_eq!(backend.evaluate_admission(&request("1")).await.unwrap(), 1);

        backend.set("seckill:stock:1", "5").await.unwrap();
        assert_eq!(backend.evaluate_admission(&request("1")).await.unwrap(), 2);
        assert_eq!(
            backend.get("seckill:stock:1").await.unwrap(),
            Some("5".to_string())
        );
        assert_eq!(backend.set_members("seckill:order:1").len(), 1);
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let (backend, _) = backend();
        backend.set_unavailable(true);
        assert!(matches!(
            backend.get("k").await,
            Err(BackendError::Unavailable(_))
        ));
        backend.set_unavailable(false);
        assert_eq!(backend.get("k").await.unwrap(), None);
    }
}
