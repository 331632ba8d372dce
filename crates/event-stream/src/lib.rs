//! Event stream substrate for the saga coordinator.
//!
//! A stream is an ordered, persistent, replayable log split into partitions.
//! Consumers read it through a consumer group whose per-partition cursor is
//! advanced only by an explicit [`EventStream::commit`]. Until a message is
//! committed every fetch hands it out again, which is the at-least-once
//! redelivery the coordinator relies on.

pub mod error;
pub mod memory;
pub mod message;
pub mod postgres;
pub mod stream;

pub use error::{Result, StreamError};
pub use memory::InMemoryEventStream;
pub use message::{Offset, Partition, StreamMessage};
pub use postgres::{PostgresEventStream, PostgresStreamOptions};
pub use stream::{ConsumerGroup, EventStream, ParseStartPositionError, StartPosition};
