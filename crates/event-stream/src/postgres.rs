use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use tokio::sync::Mutex;

use crate::{
    ConsumerGroup, EventStream, Offset, Partition, Result, StartPosition, StreamError,
    StreamMessage,
};

/// Advisory lock taken by every writer of `saga_events` (including the
/// change-feed trigger) so that offsets become visible in commit order.
pub const STREAM_WRITE_LOCK: i64 = 0x5A6A_0001;

/// Tuning for the PostgreSQL-backed stream.
#[derive(Debug, Clone)]
pub struct PostgresStreamOptions {
    /// Number of partitions keys are hashed into.
    pub partitions: u32,
    /// How long an idle fetch waits before querying again.
    pub poll_interval: Duration,
    /// Pause before handing out an uncommitted message again.
    pub redelivery_delay: Duration,
}

impl Default for PostgresStreamOptions {
    fn default() -> Self {
        Self {
            partitions: 1,
            poll_interval: Duration::from_millis(200),
            redelivery_delay: Duration::from_secs(1),
        }
    }
}

/// PostgreSQL-backed event stream.
///
/// Messages live in the `saga_events` outbox table (offset = `id`), cursors
/// in `stream_cursors`. Partitions are computed from the key with
/// `hashtext`, so rows never need rewriting when the partition count changes.
#[derive(Clone)]
pub struct PostgresEventStream {
    pool: PgPool,
    options: PostgresStreamOptions,
    delivered: Arc<Mutex<HashMap<(String, Partition), Offset>>>,
}

impl PostgresEventStream {
    /// Creates a new PostgreSQL event stream.
    pub fn new(pool: PgPool, options: PostgresStreamOptions) -> Self {
        Self {
            pool,
            options: PostgresStreamOptions {
                partitions: options.partitions.max(1),
                ..options
            },
            delivered: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn check_partition(&self, partition: Partition) -> Result<()> {
        if partition.as_u32() < self.options.partitions {
            Ok(())
        } else {
            Err(StreamError::UnknownPartition {
                partition,
                partitions: self.options.partitions,
            })
        }
    }

    fn partitions_i32(&self) -> i32 {
        self.options.partitions as i32
    }

    fn row_to_message(row: PgRow, partition: Partition) -> Result<StreamMessage> {
        Ok(StreamMessage {
            partition,
            offset: Offset::new(row.try_get("id")?),
            key: row.try_get("key")?,
            payload: row.try_get("payload")?,
            timestamp: row.try_get("created_at")?,
        })
    }

    async fn next_after(&self, partition: Partition, position: Offset) -> Result<Option<PgRow>> {
        let row = sqlx::query(
            r#"
            SELECT id, key, payload, created_at
            FROM saga_events
            WHERE id > $1 AND (hashtext(key) & 2147483647) % $2 = $3
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(position.as_i64())
        .bind(self.partitions_i32())
        .bind(partition.as_u32() as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

#[async_trait]
impl EventStream for PostgresEventStream {
    fn partition_count(&self) -> u32 {
        self.options.partitions
    }

    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<StreamMessage> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(STREAM_WRITE_LOCK)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            r#"
            INSERT INTO saga_events (key, payload)
            VALUES ($1, $2)
            RETURNING id, key, payload, created_at, (hashtext(key) & 2147483647) % $3 AS partition_id
            "#,
        )
        .bind(key)
        .bind(&payload)
        .bind(self.partitions_i32())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let partition = Partition::new(row.try_get::<i32, _>("partition_id")? as u32);
        Self::row_to_message(row, partition)
    }

    async fn attach(&self, group: &ConsumerGroup, partition: Partition) -> Result<Offset> {
        self.check_partition(partition)?;

        sqlx::query(
            r#"
            INSERT INTO stream_cursors (group_name, partition_id, position)
            VALUES (
                $1,
                $2,
                CASE WHEN $3 THEN (
                    SELECT COALESCE(MAX(id), 0)
                    FROM saga_events
                    WHERE (hashtext(key) & 2147483647) % $4 = $2
                ) ELSE 0 END
            )
            ON CONFLICT (group_name, partition_id) DO NOTHING
            "#,
        )
        .bind(group.name())
        .bind(partition.as_u32() as i32)
        .bind(group.start() == StartPosition::Latest)
        .bind(self.partitions_i32())
        .execute(&self.pool)
        .await?;

        let position: i64 = sqlx::query_scalar(
            "SELECT position FROM stream_cursors WHERE group_name = $1 AND partition_id = $2",
        )
        .bind(group.name())
        .bind(partition.as_u32() as i32)
        .fetch_one(&self.pool)
        .await?;

        Ok(Offset::new(position))
    }

    async fn fetch(&self, group: &ConsumerGroup, partition: Partition) -> Result<StreamMessage> {
        loop {
            let position = self.attach(group, partition).await?;

            if let Some(row) = self.next_after(partition, position).await? {
                let message = Self::row_to_message(row, partition)?;

                let redelivery = {
                    let mut delivered = self.delivered.lock().await;
                    delivered.insert((group.name().to_string(), partition), message.offset)
                        == Some(message.offset)
                };
                if redelivery {
                    tracing::debug!(
                        group = %group,
                        %partition,
                        offset = %message.offset,
                        "redelivering uncommitted message"
                    );
                    tokio::time::sleep(self.options.redelivery_delay).await;
                }

                return Ok(message);
            }

            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    async fn commit(&self, group: &ConsumerGroup, message: &StreamMessage) -> Result<()> {
        self.check_partition(message.partition)?;

        sqlx::query(
            r#"
            INSERT INTO stream_cursors (group_name, partition_id, position)
            VALUES ($1, $2, $3)
            ON CONFLICT (group_name, partition_id) DO UPDATE SET
                position = GREATEST(stream_cursors.position, EXCLUDED.position),
                updated_at = now()
            "#,
        )
        .bind(group.name())
        .bind(message.partition.as_u32() as i32)
        .bind(message.offset.as_i64())
        .execute(&self.pool)
        .await?;

        metrics::counter!("stream_commits_total").increment(1);
        Ok(())
    }

    async fn committed(
        &self,
        group: &ConsumerGroup,
        partition: Partition,
    ) -> Result<Option<Offset>> {
        self.check_partition(partition)?;

        let position: Option<i64> = sqlx::query_scalar(
            "SELECT position FROM stream_cursors WHERE group_name = $1 AND partition_id = $2",
        )
        .bind(group.name())
        .bind(partition.as_u32() as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(position.map(Offset::new))
    }
}
