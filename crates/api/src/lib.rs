//! HTTP API server and process wiring for the saga coordinator.
//!
//! Provides endpoints for submitting sagas and inspecting their progress,
//! with structured logging (tracing) and Prometheus metrics. The same
//! process runs the consumer workers that drive submitted sagas.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use event_stream::{EventStream, InMemoryEventStream, PostgresEventStream};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    ConsumerStats, InMemorySagaStore, PostgresSagaStore, SagaConsumer, SagaError, SagaService,
    SagaStore, TransactionalStepExecutor,
};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::sagas::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<St: SagaStore + 'static>(
    state: Arc<AppState<St>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/sagas", post(routes::sagas::submit::<St>))
        .route("/sagas/{order_id}", get(routes::sagas::get::<St>))
        .route("/stats", get(routes::stats::get::<St>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Registers descriptions for the coordinator's metrics with the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "saga_events_fetched_total",
        "Saga events fetched from the stream"
    );
    metrics::describe_counter!(
        "saga_actions_applied_total",
        "Step actions committed, by action"
    );
    metrics::describe_counter!(
        "saga_events_stale_total",
        "Events skipped because the saga had already moved on"
    );
    metrics::describe_counter!(
        "saga_decode_failures_total",
        "Events whose payload could not be decoded"
    );
    metrics::describe_counter!(
        "saga_execute_failures_total",
        "Events whose step transaction failed"
    );
    metrics::describe_counter!(
        "saga_tx_retries_total",
        "Step transactions retried after a transient failure"
    );
    metrics::describe_histogram!(
        "saga_tx_duration_seconds",
        metrics::Unit::Seconds,
        "Time to execute one step, retries included"
    );
    metrics::describe_counter!(
        "stream_commits_total",
        "Consumer cursor commits on the PostgreSQL stream"
    );
    metrics::describe_counter!("sagas_submitted_total", "Sagas accepted by the API");
    metrics::describe_counter!("sagas_finished_total", "Sagas that completed every step");
    metrics::describe_counter!("sagas_cancelled_total", "Sagas that were fully unwound");
}

/// Application state plus the consumer that drives submitted sagas.
pub struct Coordinator<St> {
    pub state: Arc<AppState<St>>,
    pub consumer: SagaConsumer<St>,
}

fn assemble<St: SagaStore + Clone>(
    store: St,
    stream: Arc<dyn EventStream>,
    config: &Config,
) -> Coordinator<St> {
    let stats = Arc::new(ConsumerStats::new());
    let executor =
        TransactionalStepExecutor::new(store.clone()).with_retry(config.retry_policy());
    let consumer =
        SagaConsumer::new(stream, executor, config.consumer_config()).with_stats(stats.clone());

    let state = Arc::new(AppState {
        service: SagaService::new(store),
        stats,
        consumer_group: config.consumer_group.clone(),
    });

    Coordinator { state, consumer }
}

/// Wires an in-memory store whose change feed publishes to an in-memory stream.
pub fn create_in_memory(config: &Config) -> Coordinator<InMemorySagaStore> {
    let stream = InMemoryEventStream::new(config.stream_partitions)
        .with_redelivery_delay(config.stream_redelivery_delay);
    let store = InMemorySagaStore::new().with_change_feed(stream.clone());
    assemble(store, Arc::new(stream), config)
}

/// Connects to PostgreSQL, runs migrations, and wires store and stream.
pub async fn create_postgres(
    config: &Config,
    database_url: &str,
) -> Result<Coordinator<PostgresSagaStore>, SagaError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(database_url)
        .await?;

    let store = PostgresSagaStore::new(pool.clone());
    store.run_migrations().await?;
    let stream = PostgresEventStream::new(pool, config.stream_options());

    Ok(assemble(store, Arc::new(stream), config))
}
