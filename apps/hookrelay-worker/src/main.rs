//! hookrelay process entry point: HTTP ingest and operator API plus the
//! event-processing and dispatch workers.

mod logging;

use std::sync::Arc;

use hookrelay_dispatch::{
    DispatchConfig, JobQueue, KvStore, MemoryKvStore, MemoryQueue, MemoryStore, Pipeline, Store,
    WebhookError,
};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() {
    // Missing .env is fine.
    let _ = dotenvy::dotenv();
    logging::init_logging(logging::DEFAULT_FILTER);

    let config = match DispatchConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let pipeline = match build_pipeline(config).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            tracing::error!("Failed to initialize pipeline: {e}");
            std::process::exit(1);
        }
    };

    let workers = pipeline.start_workers();
    let addr = pipeline.config.listen_addr;

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to address {addr}: {e}");
            std::process::exit(1);
        }
    };
    info!(%addr, "Server listening");

    if let Err(e) = axum::serve(listener, pipeline.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {e}");
    }

    workers.shutdown().await;
    info!("Shutdown complete");
}

async fn build_pipeline(config: DispatchConfig) -> Result<Pipeline, WebhookError> {
    let (store, queue) = relational_backends(&config).await?;
    let kv = breaker_backend(&config)?;
    Pipeline::new(config, store, kv, queue)
}

#[cfg(feature = "postgres")]
async fn relational_backends(
    config: &DispatchConfig,
) -> Result<(Arc<dyn Store>, Arc<dyn JobQueue>), WebhookError> {
    if let Some(url) = &config.database_url {
        let store = hookrelay_dispatch::store::PgStore::connect(url).await?;
        let queue = hookrelay_dispatch::queue::PgQueue::new(store.pool().clone(), config.queue_lease());
        info!("Using PostgreSQL store and queue");
        return Ok((Arc::new(store), Arc::new(queue)));
    }
    Ok(memory_backends(config))
}

#[cfg(not(feature = "postgres"))]
async fn relational_backends(
    config: &DispatchConfig,
) -> Result<(Arc<dyn Store>, Arc<dyn JobQueue>), WebhookError> {
    if config.database_url.is_some() {
        tracing::warn!("DATABASE_URL is set but the postgres feature is disabled");
    }
    Ok(memory_backends(config))
}

fn memory_backends(config: &DispatchConfig) -> (Arc<dyn Store>, Arc<dyn JobQueue>) {
    info!("Using in-memory store and queue");
    (
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryQueue::new(config.queue_lease())),
    )
}

#[cfg(feature = "redis")]
fn breaker_backend(config: &DispatchConfig) -> Result<Arc<dyn KvStore>, WebhookError> {
    if let Some(url) = &config.redis_url {
        info!("Using Redis for circuit breaker state");
        return Ok(Arc::new(hookrelay_dispatch::redis_store::RedisKvStore::open(
            url,
            "hookrelay",
        )?));
    }
    Ok(Arc::new(MemoryKvStore::new()))
}

#[cfg(not(feature = "redis"))]
fn breaker_backend(config: &DispatchConfig) -> Result<Arc<dyn KvStore>, WebhookError> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL is set but the redis feature is disabled");
    }
    Ok(Arc::new(MemoryKvStore::new()))
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
