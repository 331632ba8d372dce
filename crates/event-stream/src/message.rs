use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Index of one partition of a stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Partition(u32);

impl Partition {
    /// Creates a partition index from a raw value.
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw partition index.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns all partitions of a stream with `count` partitions.
    pub fn all(count: u32) -> impl Iterator<Item = Partition> {
        (0..count).map(Partition)
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a message within a stream.
///
/// Offsets grow monotonically within a partition. A cursor stores the
/// offset of the last committed message; the next fetch returns the first
/// message with a strictly greater offset. Offset 0 is "before everything".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Offset(i64);

impl Offset {
    /// Creates an offset from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the offset preceding every message.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next offset.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw offset value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Offset {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Offset> for i64 {
    fn from(offset: Offset) -> Self {
        offset.0
    }
}

/// A message read from the stream.
///
/// The payload is kept as raw bytes: decoding is the consumer's business,
/// and a payload that fails to decode must still be addressable by its
/// partition and offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Partition the message was routed to.
    pub partition: Partition,

    /// Offset of the message within its partition.
    pub offset: Offset,

    /// Routing key; messages sharing a key share a partition.
    pub key: String,

    /// Raw payload bytes.
    pub payload: Vec<u8>,

    /// When the message was appended.
    pub timestamp: DateTime<Utc>,
}
