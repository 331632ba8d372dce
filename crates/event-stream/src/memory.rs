use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Notify, RwLock};

use crate::{
    ConsumerGroup, EventStream, Offset, Partition, Result, StartPosition, StreamError,
    StreamMessage,
};

type CursorKey = (String, Partition);

#[derive(Debug, Default)]
struct StreamState {
    partitions: Vec<Vec<StreamMessage>>,
    cursors: HashMap<CursorKey, Offset>,
    delivered: HashMap<CursorKey, Offset>,
}

/// In-memory event stream implementation for testing.
///
/// Offsets are dense per partition and start at 1. Behaves like the
/// PostgreSQL stream: fetch blocks until a message past the cursor exists,
/// and uncommitted messages are redelivered.
#[derive(Debug, Clone)]
pub struct InMemoryEventStream {
    state: Arc<RwLock<StreamState>>,
    published: Arc<Notify>,
    partition_count: u32,
    redelivery_delay: Duration,
}

impl InMemoryEventStream {
    /// Creates an empty stream with the given number of partitions (at least one).
    pub fn new(partitions: u32) -> Self {
        let partition_count = partitions.max(1);
        let state = StreamState {
            partitions: vec![Vec::new(); partition_count as usize],
            ..StreamState::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            published: Arc::new(Notify::new()),
            partition_count,
            redelivery_delay: Duration::ZERO,
        }
    }

    /// Pauses before handing out a message a second time to the same group.
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Returns the partition a key is routed to (FNV-1a over the key bytes).
    pub fn partition_for(&self, key: &str) -> Partition {
        let hash = key.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
            (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
        });
        Partition::new(hash % self.partition_count)
    }

    /// Returns the total number of messages across all partitions.
    pub async fn len(&self) -> usize {
        self.state.read().await.partitions.iter().map(Vec::len).sum()
    }

    /// Returns true if nothing has been published.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns a copy of every message in a partition.
    pub async fn messages(&self, partition: Partition) -> Result<Vec<StreamMessage>> {
        let index = self.index(partition)?;
        Ok(self.state.read().await.partitions[index].clone())
    }

    fn index(&self, partition: Partition) -> Result<usize> {
        if partition.as_u32() < self.partition_count {
            Ok(partition.as_u32() as usize)
        } else {
            Err(StreamError::UnknownPartition {
                partition,
                partitions: self.partition_count,
            })
        }
    }

    fn cursor_key(group: &ConsumerGroup, partition: Partition) -> CursorKey {
        (group.name().to_string(), partition)
    }
}

impl Default for InMemoryEventStream {
    fn default() -> Self {
        Self::new(1)
    }
}

fn attach_locked(
    state: &mut StreamState,
    group: &ConsumerGroup,
    partition: Partition,
    index: usize,
) -> Offset {
    let head = Offset::new(state.partitions[index].len() as i64);
    *state
        .cursors
        .entry(InMemoryEventStream::cursor_key(group, partition))
        .or_insert_with(|| match group.start() {
            StartPosition::Latest => head,
            StartPosition::Earliest => Offset::initial(),
        })
}

#[async_trait]
impl EventStream for InMemoryEventStream {
    fn partition_count(&self) -> u32 {
        self.partition_count
    }

    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<StreamMessage> {
        let partition = self.partition_for(key);
        let index = self.index(partition)?;

        let message = {
            let mut state = self.state.write().await;
            let log = &mut state.partitions[index];
            let message = StreamMessage {
                partition,
                offset: Offset::new(log.len() as i64 + 1),
                key: key.to_string(),
                payload,
                timestamp: Utc::now(),
            };
            log.push(message.clone());
            message
        };

        self.published.notify_waiters();
        Ok(message)
    }

    async fn attach(&self, group: &ConsumerGroup, partition: Partition) -> Result<Offset> {
        let index = self.index(partition)?;
        let mut state = self.state.write().await;
        Ok(attach_locked(&mut state, group, partition, index))
    }

    async fn fetch(&self, group: &ConsumerGroup, partition: Partition) -> Result<StreamMessage> {
        let index = self.index(partition)?;

        loop {
            // Register for wakeups before looking, so a publish between the
            // check and the await is not missed.
            let notified = self.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = self.state.write().await;
                let position = attach_locked(&mut state, group, partition, index);
                let message = usize::try_from(position.as_i64())
                    .ok()
                    .and_then(|i| state.partitions[index].get(i))
                    .cloned();
                message.map(|message| {
                    let previous = state
                        .delivered
                        .insert(Self::cursor_key(group, partition), message.offset);
                    let redelivery = previous == Some(message.offset);
                    (message, redelivery)
                })
            };

            if let Some((message, redelivery)) = next {
                if redelivery && !self.redelivery_delay.is_zero() {
                    tokio::time::sleep(self.redelivery_delay).await;
                }
                return Ok(message);
            }

            notified.await;
        }
    }

    async fn commit(&self, group: &ConsumerGroup, message: &StreamMessage) -> Result<()> {
        self.index(message.partition)?;
        let mut state = self.state.write().await;
        let cursor = state
            .cursors
            .entry(Self::cursor_key(group, message.partition))
            .or_insert(message.offset);
        if *cursor < message.offset {
            *cursor = message.offset;
        }
        Ok(())
    }

    async fn committed(
        &self,
        group: &ConsumerGroup,
        partition: Partition,
    ) -> Result<Option<Offset>> {
        self.index(partition)?;
        let state = self.state.read().await;
        Ok(state
            .cursors
            .get(&Self::cursor_key(group, partition))
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn earliest(name: &str) -> ConsumerGroup {
        ConsumerGroup::new(name).with_start(StartPosition::Earliest)
    }

    #[tokio::test]
    async fn test_publish_assigns_dense_offsets() {
        let stream = InMemoryEventStream::new(1);
        let first = stream.publish("a", b"1".to_vec()).await.unwrap();
        let second = stream.publish("b", b"2".to_vec()).await.unwrap();

        assert_eq!(first.offset, Offset::new(1));
        assert_eq!(second.offset, Offset::new(2));
        assert_eq!(stream.len().await, 2);
    }

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let stream = InMemoryEventStream::new(8);
        let a = stream.publish("order-1", vec![]).await.unwrap();
        let b = stream.publish("order-1", vec![]).await.unwrap();

        assert_eq!(a.partition, b.partition);
        assert_eq!(a.partition, stream.partition_for("order-1"));
        assert!(b.offset > a.offset);
    }

    #[tokio::test]
    async fn test_uncommitted_message_is_redelivered() {
        let stream = InMemoryEventStream::new(1);
        let group = earliest("g");
        stream.publish("k", b"payload".to_vec()).await.unwrap();

        let first = stream.fetch(&group, Partition::new(0)).await.unwrap();
        let again = stream.fetch(&group, Partition::new(0)).await.unwrap();
        assert_eq!(first, again);

        stream.commit(&group, &first).await.unwrap();
        stream.publish("k", b"next".to_vec()).await.unwrap();
        let next = stream.fetch(&group, Partition::new(0)).await.unwrap();
        assert_eq!(next.payload, b"next");
    }

    #[tokio::test]
    async fn test_latest_start_skips_history() {
        let stream = InMemoryEventStream::new(1);
        stream.publish("k", b"old".to_vec()).await.unwrap();

        let group = ConsumerGroup::new("fresh");
        let cursor = stream.attach(&group, Partition::new(0)).await.unwrap();
        assert_eq!(cursor, Offset::new(1));

        stream.publish("k", b"new".to_vec()).await.unwrap();
        let message = stream.fetch(&group, Partition::new(0)).await.unwrap();
        assert_eq!(message.payload, b"new");
    }

    #[tokio::test]
    async fn test_earliest_start_replays_history() {
        let stream = InMemoryEventStream::new(1);
        stream.publish("k", b"old".to_vec()).await.unwrap();

        let message = stream
            .fetch(&earliest("replay"), Partition::new(0))
            .await
            .unwrap();
        assert_eq!(message.payload, b"old");
    }

    #[tokio::test]
    async fn test_groups_have_independent_cursors() {
        let stream = InMemoryEventStream::new(1);
        let a = earliest("a");
        let b = earliest("b");
        stream.publish("k", b"1".to_vec()).await.unwrap();

        let message = stream.fetch(&a, Partition::new(0)).await.unwrap();
        stream.commit(&a, &message).await.unwrap();

        assert_eq!(
            stream.committed(&a, Partition::new(0)).await.unwrap(),
            Some(Offset::new(1))
        );
        assert_eq!(
            stream.committed(&b, Partition::new(0)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_commit_never_moves_backwards() {
        let stream = InMemoryEventStream::new(1);
        let group = earliest("g");
        let first = stream.publish("k", vec![]).await.unwrap();
        let second = stream.publish("k", vec![]).await.unwrap();

        stream.commit(&group, &second).await.unwrap();
        stream.commit(&group, &first).await.unwrap();

        assert_eq!(
            stream.committed(&group, Partition::new(0)).await.unwrap(),
            Some(second.offset)
        );
    }

    #[tokio::test]
    async fn test_fetch_blocks_until_publish() {
        let stream = InMemoryEventStream::new(1);
        let group = earliest("g");

        let reader = {
            let stream = stream.clone();
            let group = group.clone();
            tokio::spawn(async move { stream.fetch(&group, Partition::new(0)).await })
        };

        tokio::task::yield_now().await;
        assert!(!reader.is_finished());

        stream.publish("k", b"wake".to_vec()).await.unwrap();
        let message = reader.await.unwrap().unwrap();
        assert_eq!(message.payload, b"wake");
    }

    #[tokio::test]
    async fn test_unknown_partition_is_rejected() {
        let stream = InMemoryEventStream::new(2);
        let result = stream.attach(&earliest("g"), Partition::new(5)).await;
        assert!(matches!(
            result,
            Err(StreamError::UnknownPartition { partitions: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_waits_for_delay() {
        let stream = InMemoryEventStream::new(1).with_redelivery_delay(Duration::from_secs(5));
        let group = earliest("g");
        stream.publish("k", vec![]).await.unwrap();

        stream.fetch(&group, Partition::new(0)).await.unwrap();
        let before = tokio::time::Instant::now();
        stream.fetch(&group, Partition::new(0)).await.unwrap();
        assert!(before.elapsed() >= Duration::from_secs(5));
    }
}
