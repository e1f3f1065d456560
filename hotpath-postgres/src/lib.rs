//! `PostgreSQL` relational store for `hotpath`
//!
//! [`PostgresStore`] implements [`hotpath::ShopRepository`] and
//! [`hotpath::OrderStore`] over four tables (`tb_shop`, `tb_voucher`,
//! `tb_seckill_voucher`, `tb_voucher_order`). Stock decrements are guarded by
//! `stock >= 1` predicates, and `(user_id, voucher_id)` plus `order_id` are
//! unique, so a redelivered order intent can never produce a second order.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use hotpath_postgres::{PostgresConfig, PostgresStore};
//!
//! let store = PostgresStore::with_config(
//!     "postgres://localhost/hotpath",
//!     PostgresConfig::default().with_env_overrides(),
//! )
//! .await?;
//! store.initialize_schema().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod retry;
mod store;

pub use config::{MaxConnections, PostgresConfig};
pub use retry::{map_sqlx_error, RetryStrategy};
pub use store::{PoolStatus, PostgresStore, PostgresStoreError};
