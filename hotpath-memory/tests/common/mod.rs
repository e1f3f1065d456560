//! Shared fixtures for the scenario tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hotpath::clock::ManualClock;
use hotpath::config::HotpathConfig;
use hotpath::store::Shop;
use hotpath::types::{ShopId, Timestamp};
use hotpath_memory::{InMemoryBackend, InMemoryNode, InMemoryOrderStore, InMemoryShopRepository};

/// Shared backends plus a manual clock; every node built from it joins the same "cluster".
pub struct Cluster {
    pub backend: InMemoryBackend,
    pub clock: ManualClock,
    pub shops: Arc<InMemoryShopRepository>,
    pub orders: InMemoryOrderStore,
    pub config: HotpathConfig,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_shop_latency(Duration::ZERO)
    }

    pub fn with_shop_latency(latency: Duration) -> Self {
        let clock = ManualClock::default();
        let mut shops = InMemoryShopRepository::with_clock(Arc::new(clock.clone()));
        if !latency.is_zero() {
            shops = shops.with_latency(latency);
        }
        Self {
            backend: InMemoryBackend::with_clock(Arc::new(clock.clone())),
            clock,
            shops: Arc::new(shops),
            orders: InMemoryOrderStore::new(),
            config: HotpathConfig::default(),
        }
    }

    pub fn node(&self) -> InMemoryNode {
        InMemoryNode::new(
            &self.backend,
            self.shops.clone(),
            &self.orders,
            Arc::new(self.clock.clone()),
            &self.config,
        )
    }
}

pub fn shop(id: u64, name: &str) -> Shop {
    let now = Timestamp::now();
    Shop {
        id: ShopId::new(id),
        name: name.to_string(),
        type_id: 1,
        images: String::new(),
        area: "Riverside".to_string(),
        address: format!("{id} Harbour Road"),
        x: 120.15,
        y: 30.28,
        avg_price: 60,
        sold: 0,
        comments: 0,
        score: 45,
        open_hours: "10:00-22:00".to_string(),
        create_time: now,
        update_time: now,
    }
}

/// Polls `condition` every 10 ms for up to five seconds.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
