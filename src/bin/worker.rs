use metrics_exporter_prometheus::PrometheusBuilder;
use preprocessor_worker::{
    app_state::AppState,
    config::AppConfig,
    db, routes,
    services::{
        queue::RedisQueue, status::PgStatusStore, storage::S3Storage, transform::TransformClient,
    },
    worker::{self, Worker},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Worker failed to start");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;

    let worker_id = format!("worker-{}", Uuid::new_v4());
    tracing::info!(worker_id = %worker_id, "Starting preprocessor worker");

    let prometheus_handle = Arc::new(PrometheusBuilder::new().install_recorder()?);
    worker::describe_metrics();

    tracing::info!(table = %config.job_table, "Connecting to PostgreSQL status store");
    let pool_size = u32::try_from(config.batch_size * 2 + 2).unwrap_or(u32::MAX);
    let db_pool = db::init_pool(&config.database_url, pool_size).await?;
    let statuses = PgStatusStore::new(db_pool, &config.job_table)?;
    statuses.ensure_table().await?;

    tracing::info!("Initializing S3 storage client");
    let storage = S3Storage::new(&config.s3_settings())?;

    tracing::info!(queue = %config.queue_name, "Connecting to Redis job queue");
    let queue = RedisQueue::new(
        &config.queue_url,
        &config.queue_name,
        config.visibility_timeout(),
    )?;
    queue.ping().await?;

    tracing::info!(url = %config.preprocessor_server_url, "Initializing preprocessor client");
    let transform = TransformClient::new(
        &config.preprocessor_server_url,
        config.api_key().map(str::to_owned),
        config.transform_timeout(),
    )?;

    let state = AppState::new(queue, statuses, storage, transform);
    let shutdown = CancellationToken::new();

    if let Some(addr) = &config.metrics_addr {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, "Serving /health and /metrics");
        let app = routes::router(state.clone(), prometheus_handle);
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received, finishing current batch");
        signal_shutdown.cancel();
    });

    let worker = Worker::new(
        config.worker_config(),
        state.queue.clone(),
        Arc::new(state.pipeline()),
    );
    worker.run(shutdown).await;

    tracing::info!(worker_id = %worker_id, "Worker shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
