use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Offset, Partition, Result, StreamMessage};

/// Where a consumer group starts reading a partition it has never committed on.
///
/// `Latest` is the default: a freshly attached group observes only events
/// published after it attached, not the full history. `Earliest` replays the
/// partition from the beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    #[default]
    Latest,
    Earliest,
}

impl StartPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartPosition::Latest => "latest",
            StartPosition::Earliest => "earliest",
        }
    }
}

impl std::fmt::Display for StartPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing an unknown start position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStartPositionError(String);

impl std::fmt::Display for ParseStartPositionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid start position {:?}: expected \"latest\" or \"earliest\"",
            self.0
        )
    }
}

impl std::error::Error for ParseStartPositionError {}

impl FromStr for StartPosition {
    type Err = ParseStartPositionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest" => Ok(StartPosition::Latest),
            "earliest" => Ok(StartPosition::Earliest),
            _ => Err(ParseStartPositionError(s.to_string())),
        }
    }
}

/// Identity of a consumer group.
///
/// Cursors are owned per `(group, partition)`; two groups reading the same
/// stream never influence each other's position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerGroup {
    name: String,
    start: StartPosition,
}

impl ConsumerGroup {
    /// Creates a group that starts at the latest offset on first attach.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: StartPosition::default(),
        }
    }

    /// Sets the start position used on first attach.
    pub fn with_start(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> StartPosition {
        self.start
    }
}

impl std::fmt::Display for ConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Core trait for event stream implementations.
///
/// Delivery is at-least-once: [`fetch`](EventStream::fetch) returns the
/// first message past the group's committed cursor, so a message that is
/// never committed is handed out again on every fetch. All implementations
/// must be thread-safe (Send + Sync).
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Returns the number of partitions of this stream.
    fn partition_count(&self) -> u32;

    /// Appends a message, routing it to a partition by key.
    ///
    /// Messages with the same key always land on the same partition, in
    /// publish order.
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<StreamMessage>;

    /// Establishes the group's cursor on a partition if it has none yet.
    ///
    /// The initial position follows the group's [`StartPosition`]. Returns
    /// the cursor position. Calling it again is a no-op.
    async fn attach(&self, group: &ConsumerGroup, partition: Partition) -> Result<Offset>;

    /// Blocks until a message past the group's cursor is available.
    ///
    /// Attaches the group to the partition first if needed.
    async fn fetch(&self, group: &ConsumerGroup, partition: Partition) -> Result<StreamMessage>;

    /// Advances the group's cursor to the message's offset.
    ///
    /// The cursor never moves backwards.
    async fn commit(&self, group: &ConsumerGroup, message: &StreamMessage) -> Result<()>;

    /// Returns the group's committed cursor, or None if never attached.
    async fn committed(&self, group: &ConsumerGroup, partition: Partition)
    -> Result<Option<Offset>>;
}
