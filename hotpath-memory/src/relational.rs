//! In-memory relational store: shop rows and the voucher/order tables.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hotpath::clock::{Clock, SystemClock};
use hotpath::errors::{StoreError, StoreResult};
use hotpath::store::{
    NewShop, NewVoucherOrder, OrderStore, OrderTransaction, Shop, ShopRepository, VoucherOrder,
};
use hotpath::types::{ShopId, UserId, VoucherId};
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Shop table with a read counter and optional per-read latency.
pub struct InMemoryShopRepository {
    rows: RwLock<BTreeMap<ShopId, Shop>>,
    clock: Arc<dyn Clock>,
    reads: AtomicUsize,
    latency: Option<Duration>,
}

impl std::fmt::Debug for InMemoryShopRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryShopRepository")
            .field("rows", &self.rows.read().len())
            .field("reads", &self.reads())
            .finish_non_exhaustive()
    }
}

impl InMemoryShopRepository {
    /// Empty table on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty table stamping rows with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            clock,
            reads: AtomicUsize::new(0),
            latency: None,
        }
    }

    /// Makes every `find_shop` take `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Inserts or replaces a row as is.
    pub fn put(&self, shop: Shop) {
        self.rows.write().insert(shop.id, shop);
    }

    /// Number of `find_shop` calls so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryShopRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShopRepository for InMemoryShopRepository {
    async fn find_shop(&self, id: ShopId) -> StoreResult<Option<Shop>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(self.rows.read().get(&id).cloned())
    }

    async fn insert_shop(&self, shop: NewShop) -> StoreResult<Shop> {
        let now = self.clock.now();
        let mut rows = self.rows.write();
        let id = rows
            .keys()
            .next_back()
            .map_or(1, |last| last.into_inner() + 1);
        let row = Shop {
            id: ShopId::new(id),
            name: shop.name,
            type_id: shop.type_id,
            images: shop.images,
            area: shop.area,
            address: shop.address,
            x: shop.x,
            y: shop.y,
            avg_price: shop.avg_price,
            sold: 0,
            comments: 0,
            score: 0,
            open_hours: shop.open_hours,
            create_time: now,
            update_time: now,
        };
        rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_shop(&self, shop: &Shop) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut rows = self.rows.write();
        let Some(existing) = rows.get_mut(&shop.id) else {
            return Ok(false);
        };
        *existing = Shop {
            create_time: existing.create_time,
            update_time: now,
            ..shop.clone()
        };
        Ok(true)
    }

    async fn all_ids(&self) -> StoreResult<Vec<ShopId>> {
        Ok(self.rows.read().keys().copied().collect())
    }
}

#[derive(Debug, Clone, Default)]
struct OrderTables {
    seckill_stock: HashMap<VoucherId, i64>,
    voucher_stock: HashMap<VoucherId, i64>,
    orders: Vec<VoucherOrder>,
}

/// Voucher stock and order tables.
///
/// Transactions are serialized: `begin` holds the table lock until commit or
/// rollback, and writes land in a working copy that only commit publishes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderStore {
    tables: Arc<Mutex<OrderTables>>,
}

impl InMemoryOrderStore {
    /// Empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a seckill voucher with `stock` in both stock columns.
    pub async fn seed_voucher(&self, voucher_id: VoucherId, stock: i64) {
        let mut tables = self.tables.lock().await;
        tables.seckill_stock.insert(voucher_id, stock);
        tables.voucher_stock.insert(voucher_id, stock);
    }

    /// Overwrites one stock column pair, for desync scenarios.
    pub async fn set_stock(&self, voucher_id: VoucherId, seckill: i64, voucher: i64) {
        let mut tables = self.tables.lock().await;
        tables.seckill_stock.insert(voucher_id, seckill);
        tables.voucher_stock.insert(voucher_id, voucher);
    }

    /// `(seckill, voucher)` stock of `voucher_id`.
    pub async fn stock(&self, voucher_id: VoucherId) -> (Option<i64>, Option<i64>) {
        let tables = self.tables.lock().await;
        (
            tables.seckill_stock.get(&voucher_id).copied(),
            tables.voucher_stock.get(&voucher_id).copied(),
        )
    }

    /// Committed orders in insertion order.
    pub async fn orders(&self) -> Vec<VoucherOrder> {
        self.tables.lock().await.orders.clone()
    }
}

struct InMemoryTransaction {
    committed: OwnedMutexGuard<OrderTables>,
    working: OrderTables,
}

fn decrement(stock: &mut HashMap<VoucherId, i64>, voucher_id: VoucherId) -> u64 {
    match stock.get_mut(&voucher_id) {
        Some(left) if *left >= 1 => {
            *left -= 1;
            1
        }
        _ => 0,
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn begin(&self) -> StoreResult<Box<dyn OrderTransaction>> {
        let committed = Arc::clone(&self.tables).lock_owned().await;
        let working = committed.clone();
        Ok(Box::new(InMemoryTransaction { committed, working }))
    }
}

#[async_trait]
impl OrderTransaction for InMemoryTransaction {
    async fn order_exists(&mut self, user_id: UserId, voucher_id: VoucherId) -> StoreResult<bool> {
        Ok(self
            .working
            .orders
            .iter()
            .any(|o| o.user_id == user_id && o.voucher_id == voucher_id))
    }

    async fn decrement_seckill_stock(&mut self, voucher_id: VoucherId) -> StoreResult<u64> {
        Ok(decrement(&mut self.working.seckill_stock, voucher_id))
    }

    async fn decrement_voucher_stock(&mut self, voucher_id: VoucherId) -> StoreResult<u64> {
        Ok(decrement(&mut self.working.voucher_stock, voucher_id))
    }

    async fn insert_order(&mut self, order: &NewVoucherOrder) -> StoreResult<VoucherOrder> {
        let orders = &mut self.working.orders;
        if orders
            .iter()
            .any(|o| o.user_id == order.user_id && o.voucher_id == order.voucher_id)
        {
            return Err(StoreError::UniqueViolation(
                "uq_voucher_order_user_voucher".to_string(),
            ));
        }
        if order.order_id.is_some() && orders.iter().any(|o| o.order_id == order.order_id) {
            return Err(StoreError::UniqueViolation(
                "uq_voucher_order_order_id".to_string(),
            ));
        }
        let row = VoucherOrder {
            id: orders.len() as u64 + 1,
            order_id: order.order_id,
            user_id: order.user_id,
            voucher_id: order.voucher_id,
            pay_type: order.pay_type,
            status: order.status,
            voucher_type: order.voucher_type,
            create_time: order.create_time,
        };
        orders.push(row.clone());
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let Self {
            mut committed,
            working,
        } = *self;
        *committed = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotpath::types::{OrderId, Timestamp};

    fn new_shop(name: &str) -> NewShop {
        NewShop {
            name: name.to_string(),
            type_id: 1,
            images: String::new(),
            area: "Downtown".to_string(),
            address: "1 Main St".to_string(),
            x: 120.1,
            y: 30.2,
            avg_price: 80,
            open_hours: "10:00-22:00".to_string(),
        }
    }

    fn order(user: u64) -> NewVoucherOrder {
        NewVoucherOrder::seckill(
            Some(OrderId::new(1000 + user)),
            UserId::new(user),
            VoucherId::new(1),
            Timestamp::now(),
        )
    }

    #[tokio::test]
    async fn inserted_shops_get_increasing_ids() {
        let shops = InMemoryShopRepository::new();
        let a = shops.insert_shop(new_shop("a")).await.unwrap();
        let b = shops.insert_shop(new_shop("b")).await.unwrap();

        assert_eq!(a.id, ShopId::new(1));
        assert_eq!(b.id, ShopId::new(2));
        assert_eq!(shops.all_ids().await.unwrap(), vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn update_keeps_create_time_and_reports_missing_rows() {
        let shops = InMemoryShopRepository::new();
        let mut shop = shops.insert_shop(new_shop("a")).await.unwrap();
        shop.name = "renamed".to_string();

        assert!(shops.update_shop(&shop).await.unwrap());
        let stored = shops.find_shop(shop.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.create_time, shop.create_time);

        shop.id = ShopId::new(99);
        assert!(!shops.update_shop(&shop).await.unwrap());
        assert_eq!(shops.reads(), 1);
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = InMemoryOrderStore::new();
        store.seed_voucher(VoucherId::new(1), 3).await;

        {
            let mut tx = store.begin().await.unwrap();
            assert_eq!(tx.decrement_seckill_stock(VoucherId::new(1)).await.unwrap(), 1);
            tx.insert_order(&order(1)).await.unwrap();
        }

        assert_eq!(store.stock(VoucherId::new(1)).await, (Some(3), Some(3)));
        assert!(store.orders().await.is_empty());
    }

    #[tokio::test]
    async fn committed_transaction_publishes_writes() {
        let store = InMemoryOrderStore::new();
        store.seed_voucher(VoucherId::new(1), 3).await;

        let mut tx = store.begin().await.unwrap();
        tx.decrement_seckill_stock(VoucherId::new(1)).await.unwrap();
        tx.decrement_voucher_stock(VoucherId::new(1)).await.unwrap();
        tx.insert_order(&order(1)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.stock(VoucherId::new(1)).await, (Some(2), Some(2)));
        assert_eq!(store.orders().await.len(), 1);
    }

    #[tokio::test]
    async fn guarded_decrement_stops_at_zero() {
        let store = InMemoryOrderStore::new();
        store.seed_voucher(VoucherId::new(1), 1).await;

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.decrement_seckill_stock(VoucherId::new(1)).await.unwrap(), 1);
        assert_eq!(tx.decrement_seckill_stock(VoucherId::new(1)).await.unwrap(), 0);
        assert_eq!(tx.decrement_voucher_stock(VoucherId::new(2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn second_order_for_same_pair_violates_uniqueness() {
        let store = InMemoryOrderStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&order(1)).await.unwrap();

        assert!(matches!(
            tx.insert_order(&order(1)).await,
            Err(StoreError::UniqueViolation(_))
        ));
    }
}
