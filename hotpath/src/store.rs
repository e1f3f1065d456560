//! Contracts of the relational store.
//!
//! The store is consulted only through these traits. Order materialization
//! runs inside an [`OrderTransaction`]; a transaction that is dropped without
//! [`commit`](OrderTransaction::commit) must roll back, so every early return
//! through `?` discards its writes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::StoreResult;
use crate::types::{OrderId, ShopId, Timestamp, UserId, VoucherId};

/// A shop row as cached and served by the read path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shop {
    /// Store-assigned id
    pub id: ShopId,
    /// Display name
    pub name: String,
    /// Shop category
    pub type_id: u64,
    /// Comma-separated image URLs
    pub images: String,
    /// Business district
    pub area: String,
    /// Street address
    pub address: String,
    /// Longitude
    pub x: f64,
    /// Latitude
    pub y: f64,
    /// Average spend per customer
    pub avg_price: u64,
    /// Units sold
    pub sold: u32,
    /// Review count
    pub comments: u32,
    /// Rating times ten
    pub score: u32,
    /// Opening hours, e.g. `10:00-22:00`
    pub open_hours: String,
    /// When the row was created
    pub create_time: Timestamp,
    /// When the row was last changed
    pub update_time: Timestamp,
}

/// Fields supplied when creating a shop; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewShop {
    /// Display name
    pub name: String,
    /// Shop category
    pub type_id: u64,
    /// Comma-separated image URLs
    pub images: String,
    /// Business district
    pub area: String,
    /// Street address
    pub address: String,
    /// Longitude
    pub x: f64,
    /// Latitude
    pub y: f64,
    /// Average spend per customer
    pub avg_price: u64,
    /// Opening hours, e.g. `10:00-22:00`
    pub open_hours: String,
}

/// Shop rows.
#[async_trait]
pub trait ShopRepository: Send + Sync {
    /// Reads one shop.
    async fn find_shop(&self, id: ShopId) -> StoreResult<Option<Shop>>;

    /// Inserts a shop and returns it with its assigned id.
    async fn insert_shop(&self, shop: NewShop) -> StoreResult<Shop>;

    /// Overwrites a shop. Returns whether a row was updated.
    async fn update_shop(&self, shop: &Shop) -> StoreResult<bool>;

    /// Every shop id, for existence-filter warm-up.
    async fn all_ids(&self) -> StoreResult<Vec<ShopId>>;
}

/// Payment channel recorded on an order.
pub const PAY_TYPE_BALANCE: i16 = 1;
/// Status of an order that has not been paid.
pub const STATUS_UNPAID: i16 = 1;
/// Voucher type of a seckill voucher.
pub const VOUCHER_TYPE_SECKILL: i16 = 2;

/// Order row to insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVoucherOrder {
    /// Pre-allocated id; `None` leaves uniqueness to the row id
    pub order_id: Option<OrderId>,
    /// Buyer
    pub user_id: UserId,
    /// Purchased voucher
    pub voucher_id: VoucherId,
    /// Payment channel
    pub pay_type: i16,
    /// Order status
    pub status: i16,
    /// Voucher type
    pub voucher_type: i16,
    /// When the row was created
    pub create_time: Timestamp,
}

impl NewVoucherOrder {
    /// An unpaid seckill order.
    pub fn seckill(
        order_id: Option<OrderId>,
        user_id: UserId,
        voucher_id: VoucherId,
        create_time: Timestamp,
    ) -> Self {
        Self {
            order_id,
            user_id,
            voucher_id,
            pay_type: PAY_TYPE_BALANCE,
            status: STATUS_UNPAID,
            voucher_type: VOUCHER_TYPE_SECKILL,
            create_time,
        }
    }
}

/// A durable order row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherOrder {
    /// Row id assigned by the store
    pub id: u64,
    /// Pre-allocated id, when the producer supplied one
    pub order_id: Option<OrderId>,
    /// Buyer
    pub user_id: UserId,
    /// Purchased voucher
    pub voucher_id: VoucherId,
    /// Payment channel
    pub pay_type: i16,
    /// Order status
    pub status: i16,
    /// Voucher type
    pub voucher_type: i16,
    /// When the row was created
    pub create_time: Timestamp,
}

/// Source of order transactions.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Starts a transaction.
    async fn begin(&self) -> StoreResult<Box<dyn OrderTransaction>>;
}

/// One order-materialization transaction.
///
/// Decrements are predicate-guarded (`stock >= 1`) and report affected rows;
/// they are never unconditional writes.
#[async_trait]
pub trait OrderTransaction: Send {
    /// Whether an order already exists for the pair.
    async fn order_exists(&mut self, user_id: UserId, voucher_id: VoucherId) -> StoreResult<bool>;

    /// Guarded decrement of the seckill stock. Returns rows affected.
    async fn decrement_seckill_stock(&mut self, voucher_id: VoucherId) -> StoreResult<u64>;

    /// Guarded decrement of the general voucher stock. Returns rows affected.
    async fn decrement_voucher_stock(&mut self, voucher_id: VoucherId) -> StoreResult<u64>;

    /// Inserts the order row.
    async fn insert_order(&mut self, order: &NewVoucherOrder) -> StoreResult<VoucherOrder>;

    /// Makes every write durable.
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discards every write.
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
