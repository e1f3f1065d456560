//! Error types for hotpath.
//!
//! Each subsystem has its own error enum and `*Result` alias. The taxonomy
//! follows the failure classes the concurrency layer distinguishes:
//!
//! - **NotFound**: the entity does not exist; terminal, returned directly
//! - **Busy**: a lock or coalesced call could not make progress within its
//!   bounded wait; retryable by the caller
//! - **InvariantViolation**: a guarded update affected zero rows where the
//!   admission step guaranteed it would not; left for operators
//! - **Backend / Store**: transient failures talking to the cache or the
//!   relational store; safe to retry from the client
//!
//! A duplicate purchase is *not* an error; it is an [`AdmissionOutcome`](crate::admission::AdmissionOutcome).
//!
//! Errors that travel through the [`CallCoalescer`](crate::coalesce::CallCoalescer)
//! are `Clone` so every waiter receives the same failure.

use std::time::Duration;

use thiserror::Error;

use crate::types::{MessageId, ShopId, VoucherId};

/// Failures of the shared cache / key-value backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The call did not complete within its bounded timeout.
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend could not be reached or refused the call.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be decoded.
    #[error("corrupt value under key '{key}': {detail}")]
    Corrupt {
        /// Key holding the undecodable value
        key: String,
        /// Decoder message
        detail: String,
    },

    /// The stream or consumer group the call addressed does not exist.
    #[error("no such stream or group: {0}")]
    NoSuchGroup(String),
}

impl BackendError {
    /// Whether retrying the same call later may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Failures of the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The call did not complete within its bounded timeout.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The connection to the store failed.
    #[error("store connection failed: {0}")]
    Connection(String),

    /// A uniqueness constraint rejected the write.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// The transaction could not be started, committed or rolled back.
    #[error("transaction failed: {0}")]
    Transaction(String),

    /// A row could not be mapped to a domain value.
    #[error("row mapping failed: {0}")]
    Mapping(String),
}

impl StoreError {
    /// Whether retrying the same call later may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Connection(_) | Self::Transaction(_)
        )
    }
}

/// Result type for relational store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the shop read path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShopError {
    /// Filter, cache and store agree the shop does not exist.
    #[error("shop {0} not found")]
    NotFound(ShopId),

    /// Another instance holds the rebuild lock and the entry did not appear in time.
    #[error("shop {0} is being rebuilt elsewhere, retry later")]
    Busy(ShopId),

    /// Cache backend failure.
    #[error("cache backend error: {0}")]
    Backend(#[from] BackendError),

    /// Relational store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ShopError {
    /// Whether the client may retry the request.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound(_) => false,
            Self::Busy(_) => true,
            Self::Backend(error) => error.is_retryable(),
            Self::Store(error) => error.is_retryable(),
        }
    }
}

/// Result type for the shop read path.
pub type ShopResult<T> = Result<T, ShopError>;

/// Errors surfaced by a purchase attempt.
///
/// Out-of-stock and duplicate purchases are outcomes, not errors; this enum
/// only carries the "system error" class.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The admission script could not be evaluated.
    #[error("admission backend error: {0}")]
    Backend(#[from] BackendError),

    /// The script answered with a code this version does not understand.
    #[error("unexpected admission reply code {0}")]
    UnexpectedReply(i64),
}

/// Result type for admission.
pub type AdmissionResult<T> = Result<T, AdmissionError>;

/// Counter that a guarded decrement refused to lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockCounter {
    /// The seckill-specific stock column.
    Seckill,
    /// The paired general voucher stock column.
    Voucher,
}

impl std::fmt::Display for StockCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Seckill => f.write_str("seckill stock"),
            Self::Voucher => f.write_str("voucher stock"),
        }
    }
}

/// Errors raised while turning an order intent into a durable order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MaterializeError {
    /// The stream message is missing fields or carries unparsable ids.
    #[error("malformed order intent: {0}")]
    Malformed(String),

    /// A guarded stock decrement affected zero rows although admission succeeded.
    #[error("stock desync for voucher {voucher_id}: {counter} could not be decremented")]
    InvariantViolation {
        /// Voucher whose counters disagree with the admission state
        voucher_id: VoucherId,
        /// Counter that refused the decrement
        counter: StockCounter,
    },

    /// Relational store failure; the message stays pending and is retried.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl MaterializeError {
    /// Whether the message should be parked for operators instead of retried.
    pub const fn requires_intervention(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::InvariantViolation { .. })
    }
}

/// Result type for materialization.
pub type MaterializeResult<T> = Result<T, MaterializeError>;

/// Errors of the order stream pipeline lifecycle and transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// `start()` was called on a running pipeline.
    #[error("pipeline is already running")]
    AlreadyRunning,

    /// `stop()` was called on a pipeline that is not running.
    #[error("pipeline is not running")]
    NotRunning,

    /// Stream transport failure.
    #[error("stream backend error: {0}")]
    Backend(#[from] BackendError),

    /// Acknowledgement referenced a message that is not pending.
    #[error("message {0} is not pending in the group")]
    NotPending(MessageId),
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Configuration loading or validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidVar {
        /// Variable name
        name: String,
        /// Raw value
        value: String,
        /// Parser or validator message
        reason: String,
    },

    /// Sections are individually valid but inconsistent with each other.
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}
