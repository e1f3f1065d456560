//! `hotpath` - cache-aside reads and flash-sale admission for hot entities
//!
//! Two paths share one cache/coordination backend:
//!
//! - the read path ([`ShopCacheOrchestrator`]) answers entity lookups from a
//!   logically-expiring cache, rejects unknown ids through an
//!   [`ExistenceFilter`], coalesces concurrent misses and rebuilds stale
//!   entries in the background under a [`DistributedMutex`];
//! - the write path ([`AdmissionScript`]) admits seckill purchases in one
//!   atomic backend evaluation and hands them to the [`OrderStreamPipeline`],
//!   whose workers materialize orders idempotently with [`OrderMaterializer`].
//!
//! Backends are traits ([`KeyValueStore`], [`BitmapStore`],
//! [`AdmissionBackend`], [`StreamLog`], [`ShopRepository`], [`OrderStore`]);
//! adapter crates provide the implementations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod background;
pub mod backend;
pub mod backoff;
pub mod clock;
pub mod coalesce;
pub mod config;
pub mod errors;
pub mod existence;
pub mod id_gen;
pub mod intent;
pub mod logical_cache;
pub mod materializer;
pub mod mutex;
pub mod pipeline;
pub mod shop;
pub mod store;
pub mod telemetry;
pub mod timeout;
pub mod types;

#[cfg(test)]
mod testing;

pub use admission::{AdmissionCode, AdmissionOutcome, AdmissionScript};
pub use background::{BackgroundPool, PoolStats};
pub use backend::{
    AdmissionBackend, AdmissionRequest, BitmapStore, KeyValueStore, ReadCursor, StreamGroup,
    StreamLog, StreamMessage, StreamStats,
};
pub use backoff::{BackoffPolicy, Deadline};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coalesce::CallCoalescer;
pub use config::HotpathConfig;
pub use errors::{
    AdmissionError, BackendError, ConfigError, MaterializeError, PipelineError, ShopError,
    StoreError,
};
pub use existence::{BloomParameters, ExistenceFilter};
pub use id_gen::{IdGenerator, TimePartitionedIdGenerator};
pub use intent::OrderIntent;
pub use logical_cache::{CacheEntry, CacheRead, LogicalExpiryCache};
pub use materializer::{MaterializeOutcome, OrderMaterializer, StockCounter};
pub use mutex::{Acquisition, DistributedMutex, LockLease};
pub use pipeline::{OrderStreamPipeline, StreamInfo};
pub use shop::ShopCacheOrchestrator;
pub use store::{
    NewShop, NewVoucherOrder, OrderStore, OrderTransaction, Shop, ShopRepository, VoucherOrder,
};
pub use telemetry::{init_logging, LogFormat};
pub use types::{
    ConsumerName, EntityKind, MessageId, OrderId, ShopId, Timestamp, UserId, VoucherId,
};
