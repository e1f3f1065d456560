//! Contracts of the shared cache / key-value backend.
//!
//! The backend is a multi-writer resource shared by every service instance.
//! Each trait covers one facility the concurrency layer relies on, and every
//! method is a single atomic backend operation. Implementations live in
//! adapter crates; `hotpath-memory` provides the reference one.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::BackendResult;
use crate::types::{ConsumerName, MessageId};

/// Plain string keys with optional expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads a key; `None` when absent or expired.
    async fn get(&self, key: &str) -> BackendResult<Option<String>>;

    /// Writes a key without expiry.
    async fn set(&self, key: &str, value: &str) -> BackendResult<()>;

    /// Writes a key that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<()>;

    /// Writes a key only if it is absent. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<bool>;

    /// Deletes a key only if it currently holds `expected`. Returns whether it was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> BackendResult<bool>;

    /// Deletes a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> BackendResult<bool>;

    /// Increments an integer key, creating it at zero first. Returns the new value.
    async fn increment(&self, key: &str) -> BackendResult<u64>;
}

/// Bit arrays addressed by offset.
#[async_trait]
pub trait BitmapStore: Send + Sync {
    /// Sets every listed bit.
    async fn set_bits(&self, key: &str, offsets: &[u64]) -> BackendResult<()>;

    /// Reads every listed bit, in order. Missing keys read as all zeros.
    async fn get_bits(&self, key: &str, offsets: &[u64]) -> BackendResult<Vec<bool>>;
}

/// Everything the admission script needs, evaluated as one atomic unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    /// Integer key holding remaining seckill stock
    pub stock_key: String,
    /// Set of user ids already admitted for the voucher
    pub buyers_key: String,
    /// Stream receiving the order intent
    pub stream_key: String,
    /// Member added to the buyer set
    pub buyer: String,
    /// Fields of the order intent appended on success
    pub intent: BTreeMap<String, String>,
}

/// Atomic server-side admission evaluation.
///
/// Reply codes: `0` admitted, `1` stock missing or exhausted, `2` buyer
/// already admitted. On `0` the stock was decremented, the buyer added to the
/// set and the intent appended to the stream, all in the same step.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Runs the admission script for one request.
    async fn evaluate_admission(&self, request: &AdmissionRequest) -> BackendResult<i64>;
}

/// A stream and one of its consumer groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamGroup {
    /// Stream key
    pub stream: String,
    /// Consumer group name
    pub group: String,
}

impl StreamGroup {
    /// Addresses `group` on `stream`.
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
        }
    }
}

/// Where a group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Messages already delivered to this consumer and not yet acknowledged,
    /// strictly after `after` when given.
    Pending {
        /// Exclusive lower bound for paging through the pending list
        after: Option<MessageId>,
    },
    /// Messages never delivered to the group.
    New,
}

/// One delivered stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Position in the stream
    pub id: MessageId,
    /// Field map as appended
    pub fields: BTreeMap<String, String>,
    /// How many times the message has been delivered, this delivery included
    pub delivery_count: u32,
}

/// Pending state of one consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStats {
    /// Consumer name
    pub name: String,
    /// Messages delivered to it and not acknowledged
    pub pending: u64,
}

/// Snapshot of a stream and one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    /// Messages in the stream
    pub length: u64,
    /// Messages delivered to the group and not acknowledged
    pub pending: u64,
    /// Last id handed out to the group
    pub last_delivered: Option<MessageId>,
    /// Per-consumer pending counts
    pub consumers: Vec<ConsumerStats>,
}

/// Durable append log with consumer-group semantics.
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Creates the stream and group if missing. Returns whether the group was created.
    async fn ensure_group(&self, group: &StreamGroup) -> BackendResult<bool>;

    /// Appends a message.
    async fn append(
        &self,
        stream: &str,
        fields: BTreeMap<String, String>,
    ) -> BackendResult<MessageId>;

    /// Reads up to `count` messages for `consumer`.
    ///
    /// [`ReadCursor::New`] waits up to `block` for messages to arrive and
    /// moves them into the consumer's pending list.
    async fn read_group(
        &self,
        group: &StreamGroup,
        consumer: &ConsumerName,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> BackendResult<Vec<StreamMessage>>;

    /// Acknowledges messages. Returns how many were pending.
    async fn ack(&self, group: &StreamGroup, ids: &[MessageId]) -> BackendResult<u64>;

    /// Transfers up to `count` messages pending longer than `min_idle` on
    /// other consumers to `consumer`.
    async fn claim_idle(
        &self,
        group: &StreamGroup,
        consumer: &ConsumerName,
        min_idle: Duration,
        count: usize,
    ) -> BackendResult<Vec<StreamMessage>>;

    /// Stream length and pending counts.
    async fn stats(&self, group: &StreamGroup) -> BackendResult<StreamStats>;
}
