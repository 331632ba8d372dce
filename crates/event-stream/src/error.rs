use thiserror::Error;

use crate::Partition;

/// Errors that can occur when interacting with the event stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The requested partition does not exist on this stream.
    #[error("Unknown partition {partition}: stream has {partitions} partition(s)")]
    UnknownPartition { partition: Partition, partitions: u32 },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for event stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;
