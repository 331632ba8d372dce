//! API server entry point.

use api::Coordinator;
use api::config::{Config, LogFormat};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::SagaStore;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = config.log_format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

async fn serve<St: SagaStore + 'static>(
    config: Config,
    coordinator: Coordinator<St>,
    metrics_handle: PrometheusHandle,
) {
    let Coordinator { state, consumer } = coordinator;

    // Pin the group's start offsets before any request can publish.
    consumer
        .attach_all()
        .await
        .expect("failed to attach consumer group");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = tokio::spawn(async move {
        if let Err(err) = consumer.run_all(shutdown_rx).await {
            tracing::error!(error = %err, "consumer workers stopped");
        }
    });

    let app = api::create_app(state, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, partitions = config.stream_partitions, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Workers finish the event in hand before stopping.
    let _ = shutdown_tx.send(true);
    if let Err(err) = workers.await {
        tracing::error!(error = %err, "consumer task panicked");
    }

    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    api::describe_metrics();

    // 3. Wire store, stream, and consumer, then serve
    match config.database_url.clone() {
        Some(url) => {
            tracing::info!("using PostgreSQL store and stream");
            let coordinator = api::create_postgres(&config, &url)
                .await
                .expect("failed to initialize PostgreSQL");
            serve(config, coordinator, metrics_handle).await;
        }
        None => {
            tracing::info!("DATABASE_URL not set, running in memory");
            let coordinator = api::create_in_memory(&config);
            serve(config, coordinator, metrics_handle).await;
        }
    }
}
