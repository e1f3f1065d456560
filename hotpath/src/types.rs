//! Core types for the `hotpath` concurrency-control layer.
//!
//! Identifiers are `nutype` newtypes so a voucher id can never be passed where
//! a user id is expected. Everything here is cheap to copy and serializable.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};

/// Identifier of a shop row.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    From,
    Into,
    Serialize,
    Deserialize
))]
pub struct ShopId(u64);

/// Identifier of an authenticated caller.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    From,
    Into,
    Serialize,
    Deserialize
))]
pub struct UserId(u64);

/// Identifier of a voucher (the seckill voucher shares the id of its general voucher).
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    From,
    Into,
    Serialize,
    Deserialize
))]
pub struct VoucherId(u64);

/// Pre-allocated order identifier produced by the id generator.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    From,
    Into,
    Serialize,
    Deserialize
))]
pub struct OrderId(u64);

/// Name of a consumer inside a stream consumer group.
///
/// Non-empty after trimming and at most 64 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ConsumerName(String);

/// Kind of entity tracked by the existence filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Shop records served by the cache orchestrator.
    Shop,
    /// Vouchers (general and seckill).
    Voucher,
}

impl EntityKind {
    /// Stable name used in backend keys.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shop => "shop",
            Self::Voucher => "voucher",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a message in a stream: `<millis>-<sequence>`.
///
/// Ordering follows append order, which is what pending-list paging relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId {
    millis: u64,
    sequence: u64,
}

impl MessageId {
    /// Creates a message id from its two components.
    pub const fn new(millis: u64, sequence: u64) -> Self {
        Self { millis, sequence }
    }

    /// Millisecond component.
    pub const fn millis(self) -> u64 {
        self.millis
    }

    /// Sequence component within the millisecond.
    pub const fn sequence(self) -> u64 {
        self.sequence
    }

    /// The id that must follow `self` when appended in the same or an earlier millisecond.
    #[must_use]
    pub const fn successor_at(self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.sequence + 1)
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.sequence)
    }
}

/// Error returned when a message id string is not `<u64>-<u64>`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream message id: {0:?}")]
pub struct MessageIdParseError(pub String);

impl FromStr for MessageId {
    type Err = MessageIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, sequence) = s
            .split_once('-')
            .ok_or_else(|| MessageIdParseError(s.to_string()))?;
        let millis = millis
            .parse()
            .map_err(|_| MessageIdParseError(s.to_string()))?;
        let sequence = sequence
            .parse()
            .map_err(|_| MessageIdParseError(s.to_string()))?;
        Ok(Self::new(millis, sequence))
    }
}

/// A point in time.
///
/// Wraps a UTC `DateTime` so that clock arithmetic lives in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Milliseconds since the Unix epoch, clamped at zero.
    pub fn unix_millis(&self) -> u64 {
        u64::try_from(self.0.timestamp_millis()).unwrap_or(0)
    }

    /// Adds a std duration, saturating at the maximum representable instant.
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        TimeDelta::from_std(duration)
            .ok()
            .and_then(|delta| self.0.checked_add_signed(delta))
            .map_or(Self(DateTime::<Utc>::MAX_UTC), Self)
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn duration_since(&self, earlier: Self) -> Duration {
        (self.0 - earlier.0).to_std().unwrap_or(Duration::ZERO)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
