//! `PostgreSQL` implementation of the relational contracts.

use std::time::Duration;

use async_trait::async_trait;
use hotpath::errors::{StoreError, StoreResult};
use hotpath::store::{
    NewShop, NewVoucherOrder, OrderStore, OrderTransaction, Shop, ShopRepository, VoucherOrder,
};
use hotpath::types::{OrderId, ShopId, Timestamp, UserId, VoucherId};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{query, Pool, Postgres, Row, Transaction};
use thiserror::Error;
use tracing::{info, instrument};

use crate::config::PostgresConfig;
use crate::retry::{map_sqlx_error, retry_operation, RetryStrategy};

const SCHEMA: &str = include_str!("../migrations/0001_init.sql");

const SHOP_COLUMNS: &str = "id, name, type_id, images, area, address, x, y, avg_price, \
     sold, comments, score, open_hours, create_time, update_time";

/// Failures while setting the store up.
#[derive(Debug, Error)]
pub enum PostgresStoreError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// The schema could not be applied.
    #[error("failed to apply schema")]
    SchemaFailed(#[source] sqlx::Error),
}

/// Shop and voucher-order tables in `PostgreSQL`.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Pool<Postgres>,
    retry: RetryStrategy,
}

impl PostgresStore {
    /// Connects with default configuration.
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connects with `config`.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresStoreError> {
        let connection_string = connection_string.into();
        let max_connections: std::num::NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresStoreError::ConnectionFailed)?;
        info!(max_connections = max_connections.get(), "postgres pool ready");
        Ok(Self {
            pool,
            retry: config.retry,
        })
    }

    /// Wraps an existing pool.
    pub const fn from_pool(pool: Pool<Postgres>, retry: RetryStrategy) -> Self {
        Self { pool, retry }
    }

    /// Creates the tables if they do not exist.
    pub async fn initialize_schema(&self) -> Result<(), PostgresStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(PostgresStoreError::SchemaFailed)?;
        info!("postgres schema initialized");
        Ok(())
    }

    /// Creates a seckill voucher with `stock` in both stock columns.
    ///
    /// The admission stock counter must be preloaded separately.
    #[instrument(skip(self, title))]
    pub async fn create_seckill_voucher(
        &self,
        shop_id: ShopId,
        title: &str,
        stock: u32,
        begin: Timestamp,
        end: Timestamp,
    ) -> StoreResult<VoucherId> {
        let stock = to_i32(stock)?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let id: i64 = query(
            "INSERT INTO tb_voucher (shop_id, title, type, stock) VALUES ($1, $2, 1, $3) RETURNING id",
        )
        .bind(to_i64(shop_id.into_inner())?)
        .bind(title)
        .bind(stock)
        .fetch_one(&mut *tx)
        .await
        .and_then(|row| row.try_get("id"))
        .map_err(map_sqlx_error)?;

        query(
            "INSERT INTO tb_seckill_voucher (voucher_id, stock, begin_time, end_time) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(stock)
        .bind(begin.into_datetime())
        .bind(end.into_datetime())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        info!(voucher_id = id, "seckill voucher created");
        Ok(VoucherId::new(from_i64(id)?))
    }

    /// `(seckill, voucher)` stock of `voucher_id`, `None` when missing.
    pub async fn stock(&self, voucher_id: VoucherId) -> StoreResult<Option<(i32, i32)>> {
        let row = query(
            "SELECT s.stock AS seckill, v.stock AS general
             FROM tb_seckill_voucher s JOIN tb_voucher v ON v.id = s.voucher_id
             WHERE s.voucher_id = $1",
        )
        .bind(to_i64(voucher_id.into_inner())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        match row {
            Some(row) => Ok(Some((get(&row, "seckill")?, get(&row, "general")?))),
            None => Ok(None),
        }
    }

    /// Orders placed for `voucher_id`.
    pub async fn orders_for(&self, voucher_id: VoucherId) -> StoreResult<Vec<VoucherOrder>> {
        let rows = query(
            "SELECT id, order_id, user_id, voucher_id, pay_type, status, voucher_type, create_time
             FROM tb_voucher_order WHERE voucher_id = $1 ORDER BY id",
        )
        .bind(to_i64(voucher_id.into_inner())?)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter().map(order_from_row).collect()
    }
}

fn to_i64(value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Mapping(format!("{value} exceeds BIGINT")))
}

fn from_i64(value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Mapping(format!("negative id {value}")))
}

fn to_i32(value: u32) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::Mapping(format!("{value} exceeds INTEGER")))
}

fn from_i32(value: i32) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Mapping(format!("negative counter {value}")))
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column).map_err(map_sqlx_error)
}

fn shop_from_row(row: &PgRow) -> StoreResult<Shop> {
    Ok(Shop {
        id: ShopId::new(from_i64(get(row, "id")?)?),
        name: get(row, "name")?,
        type_id: from_i64(get(row, "type_id")?)?,
        images: get(row, "images")?,
        area: get(row, "area")?,
        address: get(row, "address")?,
        x: get(row, "x")?,
        y: get(row, "y")?,
        avg_price: from_i64(get(row, "avg_price")?)?,
        sold: from_i32(get(row, "sold")?)?,
        comments: from_i32(get(row, "comments")?)?,
        score: from_i32(get(row, "score")?)?,
        open_hours: get(row, "open_hours")?,
        create_time: Timestamp::new(get(row, "create_time")?),
        update_time: Timestamp::new(get(row, "update_time")?),
    })
}

fn order_from_row(row: &PgRow) -> StoreResult<VoucherOrder> {
    let order_id: Option<i64> = get(row, "order_id")?;
    Ok(VoucherOrder {
        id: from_i64(get(row, "id")?)?,
        order_id: order_id.map(from_i64).transpose()?.map(OrderId::new),
        user_id: UserId::new(from_i64(get(row, "user_id")?)?),
        voucher_id: VoucherId::new(from_i64(get(row, "voucher_id")?)?),
        pay_type: get(row, "pay_type")?,
        status: get(row, "status")?,
        voucher_type: get(row, "voucher_type")?,
        create_time: Timestamp::new(get(row, "create_time")?),
    })
}

#[async_trait]
impl ShopRepository for PostgresStore {
    #[instrument(name = "postgres.find_shop", skip(self))]
    async fn find_shop(&self, id: ShopId) -> StoreResult<Option<Shop>> {
        let key = to_i64(id.into_inner())?;
        let sql = format!("SELECT {SHOP_COLUMNS} FROM tb_shop WHERE id = $1");
        let (sql, pool) = (sql.as_str(), &self.pool);
        let row = retry_operation(&self.retry, "find_shop", || async move {
            query(sql)
                .bind(key)
                .fetch_optional(pool)
                .await
                .map_err(map_sqlx_error)
        })
        .await?;
        row.as_ref().map(shop_from_row).transpose()
    }

    #[instrument(name = "postgres.insert_shop", skip(self, shop))]
    async fn insert_shop(&self, shop: NewShop) -> StoreResult<Shop> {
        let sql = format!(
            "INSERT INTO tb_shop (name, type_id, images, area, address, x, y, avg_price, open_hours)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING {SHOP_COLUMNS}"
        );
        let row = query(&sql)
            .bind(&shop.name)
            .bind(to_i64(shop.type_id)?)
            .bind(&shop.images)
            .bind(&shop.area)
            .bind(&shop.address)
            .bind(shop.x)
            .bind(shop.y)
            .bind(to_i64(shop.avg_price)?)
            .bind(&shop.open_hours)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        shop_from_row(&row)
    }

    #[instrument(name = "postgres.update_shop", skip(self, shop), fields(shop_id = %shop.id))]
    async fn update_shop(&self, shop: &Shop) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let result = query(
            "UPDATE tb_shop SET name = $2, type_id = $3, images = $4, area = $5, address = $6,
                 x = $7, y = $8, avg_price = $9, sold = $10, comments = $11, score = $12,
                 open_hours = $13, update_time = now()
             WHERE id = $1",
        )
        .bind(to_i64(shop.id.into_inner())?)
        .bind(&shop.name)
        .bind(to_i64(shop.type_id)?)
        .bind(&shop.images)
        .bind(&shop.area)
        .bind(&shop.address)
        .bind(shop.x)
        .bind(shop.y)
        .bind(to_i64(shop.avg_price)?)
        .bind(to_i32(shop.sold)?)
        .bind(to_i32(shop.comments)?)
        .bind(to_i32(shop.score)?)
        .bind(&shop.open_hours)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn all_ids(&self) -> StoreResult<Vec<ShopId>> {
        let pool = &self.pool;
        let rows = retry_operation(&self.retry, "all_shop_ids", || async move {
            query("SELECT id FROM tb_shop ORDER BY id")
                .fetch_all(pool)
                .await
                .map_err(map_sqlx_error)
        })
        .await?;
        rows.iter()
            .map(|row| Ok(ShopId::new(from_i64(get(row, "id")?)?)))
            .collect()
    }
}

/// One materialization transaction. Dropping it without commit rolls back.
struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn begin(&self) -> StoreResult<Box<dyn OrderTransaction>> {
        let pool = &self.pool;
        let tx = retry_operation(&self.retry, "begin", || async move {
            pool.begin().await.map_err(map_sqlx_error)
        })
        .await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }
}

#[async_trait]
impl OrderTransaction for PostgresTransaction {
    async fn order_exists(&mut self, user_id: UserId, voucher_id: VoucherId) -> StoreResult<bool> {
        let voucher = to_i64(voucher_id.into_inner())?;
        // Serializes materializations of the same voucher for the rest of the transaction.
        query("SELECT stock FROM tb_seckill_voucher WHERE voucher_id = $1 FOR UPDATE")
            .bind(voucher)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        let row = query(
            "SELECT EXISTS (SELECT 1 FROM tb_voucher_order WHERE user_id = $1 AND voucher_id = $2) AS present",
        )
        .bind(to_i64(user_id.into_inner())?)
        .bind(voucher)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        get(&row, "present")
    }

    async fn decrement_seckill_stock(&mut self, voucher_id: VoucherId) -> StoreResult<u64> {
        let result = query(
            "UPDATE tb_seckill_voucher SET stock = stock - 1, update_time = now()
             WHERE voucher_id = $1 AND stock >= 1",
        )
        .bind(to_i64(voucher_id.into_inner())?)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn decrement_voucher_stock(&mut self, voucher_id: VoucherId) -> StoreResult<u64> {
        let result = query(
            "UPDATE tb_voucher SET stock = stock - 1, update_time = now()
             WHERE id = $1 AND stock >= 1",
        )
        .bind(to_i64(voucher_id.into_inner())?)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn insert_order(&mut self, order: &NewVoucherOrder) -> StoreResult<VoucherOrder> {
        let order_id = order
            .order_id
            .map(|id| to_i64(id.into_inner()))
            .transpose()?;
        let row = query(
            "INSERT INTO tb_voucher_order
                 (order_id, user_id, voucher_id, pay_type, status, voucher_type, create_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id, order_id, user_id, voucher_id, pay_type, status, voucher_type, create_time",
        )
        .bind(order_id)
        .bind(to_i64(order.user_id.into_inner())?)
        .bind(to_i64(order.voucher_id.into_inner())?)
        .bind(order.pay_type)
        .bind(order.status)
        .bind(order.voucher_type)
        .bind(order.create_time.into_datetime())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        order_from_row(&row)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}

/// Pool statistics for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections
    pub size: u32,
    /// Idle connections
    pub idle: usize,
}

impl PostgresStore {
    /// Current pool usage.
    pub fn pool_status(&self) -> PoolStatus {
        PoolStatus {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }

    /// Round-trips a trivial query within `limit`.
    pub async fn ping(&self, limit: Duration) -> StoreResult<()> {
        hotpath::timeout::bounded(limit, async {
            query("SELECT 1")
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(map_sqlx_error)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_outside_bigint_are_mapping_errors() {
        assert!(matches!(to_i64(u64::MAX), Err(StoreError::Mapping(_))));
        assert_eq!(to_i64(42), Ok(42));
        assert!(matches!(from_i64(-1), Err(StoreError::Mapping(_))));
        assert!(matches!(from_i32(-5), Err(StoreError::Mapping(_))));
    }

    #[test]
    fn schema_declares_the_uniqueness_the_materializer_relies_on() {
        assert!(SCHEMA.contains("UNIQUE (user_id, voucher_id)"));
        assert!(SCHEMA.contains("order_id     BIGINT      UNIQUE"));
    }
}
