//! PostgreSQL integration tests for the outbox-backed stream.
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p event-stream --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use event_stream::{
    ConsumerGroup, EventStream, Offset, Partition, PostgresEventStream, PostgresStreamOptions,
    StartPosition,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_stream_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_stream(partitions: u32) -> PostgresEventStream {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_events, stream_cursors RESTART IDENTITY")
        .execute(&pool)
        .await
        .unwrap();

    PostgresEventStream::new(
        pool,
        PostgresStreamOptions {
            partitions,
            poll_interval: Duration::from_millis(20),
            redelivery_delay: Duration::from_millis(10),
        },
    )
}

fn earliest(name: &str) -> ConsumerGroup {
    ConsumerGroup::new(name).with_start(StartPosition::Earliest)
}

#[tokio::test]
#[serial]
async fn publish_and_fetch_in_order() {
    let stream = get_test_stream(1).await;
    let group = earliest("ordering");

    stream.publish("a", b"first".to_vec()).await.unwrap();
    stream.publish("a", b"second".to_vec()).await.unwrap();

    let first = stream.fetch(&group, Partition::new(0)).await.unwrap();
    assert_eq!(first.payload, b"first");
    stream.commit(&group, &first).await.unwrap();

    let second = stream.fetch(&group, Partition::new(0)).await.unwrap();
    assert_eq!(second.payload, b"second");
    assert!(second.offset > first.offset);
}

#[tokio::test]
#[serial]
async fn uncommitted_message_is_redelivered() {
    let stream = get_test_stream(1).await;
    let group = earliest("redelivery");

    stream.publish("a", b"payload".to_vec()).await.unwrap();

    let first = stream.fetch(&group, Partition::new(0)).await.unwrap();
    let again = stream.fetch(&group, Partition::new(0)).await.unwrap();
    assert_eq!(first.offset, again.offset);
    assert_eq!(
        stream.committed(&group, Partition::new(0)).await.unwrap(),
        Some(Offset::initial())
    );
}

#[tokio::test]
#[serial]
async fn latest_group_skips_existing_messages() {
    let stream = get_test_stream(1).await;
    stream.publish("a", b"history".to_vec()).await.unwrap();

    let group = ConsumerGroup::new("latest");
    let cursor = stream.attach(&group, Partition::new(0)).await.unwrap();
    assert_eq!(cursor, Offset::new(1));

    stream.publish("a", b"fresh".to_vec()).await.unwrap();
    let message = stream.fetch(&group, Partition::new(0)).await.unwrap();
    assert_eq!(message.payload, b"fresh");
}

#[tokio::test]
#[serial]
async fn keys_are_routed_to_stable_partitions() {
    let stream = get_test_stream(4).await;

    let a1 = stream.publish("key-a", vec![]).await.unwrap();
    let a2 = stream.publish("key-a", vec![]).await.unwrap();
    assert_eq!(a1.partition, a2.partition);

    let group = earliest("routing");
    let fetched = stream.fetch(&group, a1.partition).await.unwrap();
    assert_eq!(fetched.key, "key-a");
}

#[tokio::test]
#[serial]
async fn commit_is_monotonic() {
    let stream = get_test_stream(1).await;
    let group = earliest("monotonic");

    let first = stream.publish("a", vec![]).await.unwrap();
    let second = stream.publish("a", vec![]).await.unwrap();

    stream.commit(&group, &second).await.unwrap();
    stream.commit(&group, &first).await.unwrap();

    assert_eq!(
        stream.committed(&group, Partition::new(0)).await.unwrap(),
        Some(second.offset)
    );
}
