//! Event ingestion, subscription matching and webhook dispatch.
//!
//! Producers post events to a source's ingest URL. Each event is verified,
//! deduplicated and persisted, then matched against the project's
//! subscriptions on a worker. Every match becomes an [`models::EventDelivery`]
//! that is pushed to its endpoint by the dispatch workers, with signed
//! payloads, per-subscription retry policies and a per-endpoint circuit
//! breaker shared across workers.
//!
//! [`Pipeline`] wires the stores, queue and services together for the binary
//! and for tests.

pub mod circuit_breaker;
pub mod config;
pub mod crypto;
pub mod dedup;
pub mod error;
pub mod filter;
pub mod handlers;
pub mod kv;
pub mod models;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod retry;
pub mod router;
pub mod services;
pub mod store;
pub mod validation;
pub mod verifier;
pub mod worker;

use std::sync::Arc;

use axum::Router;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager, CircuitState};
pub use config::{ConfigError, DispatchConfig};
pub use error::{ApiResult, WebhookError};
pub use kv::{KvStore, MemoryKvStore};
pub use queue::{Job, JobQueue, MemoryQueue, CREATE_EVENT_QUEUE, EVENT_DELIVERY_QUEUE};
pub use router::{api_router, AppState};
pub use store::{MemoryStore, Store};
pub use worker::{run_once, JobHandler, PipelineHandler, WorkerHandle, WorkerPool, WorkerPoolConfig};

use dedup::Deduplicator;
use services::delivery_service::build_http_client;
use services::{
    CatalogService, DeliveryService, EventProcessor, IngestService, OperatorService, TokenService,
};

/// The assembled dispatch pipeline.
#[derive(Clone)]
pub struct Pipeline {
    pub config: DispatchConfig,
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub ingest: Arc<IngestService>,
    pub processor: Arc<EventProcessor>,
    pub delivery: Arc<DeliveryService>,
    pub operator: Arc<OperatorService>,
    pub catalog: Arc<CatalogService>,
}

impl Pipeline {
    /// Wire the services over the given backends.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::Internal` if the outbound HTTP client cannot be
    /// built.
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn Store>,
        kv: Arc<dyn KvStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Result<Self, WebhookError> {
        let http_client = build_http_client(config.http_timeout())?;
        let breakers = Arc::new(CircuitBreakerManager::new(kv, config.breaker_ttl()));
        let tokens = Arc::new(TokenService::new(http_client.clone()));

        let ingest = Arc::new(IngestService::new(
            store.clone(),
            queue.clone(),
            Deduplicator::new(store.clone(), config.dedup_window()),
            config.max_payload_bytes,
        ));
        let processor = Arc::new(EventProcessor::new(store.clone(), queue.clone()));
        let delivery = Arc::new(DeliveryService::new(
            store.clone(),
            queue.clone(),
            breakers.clone(),
            tokens,
            http_client,
            &config,
        ));
        let operator = Arc::new(OperatorService::new(
            store.clone(),
            queue.clone(),
            breakers.clone(),
            processor.clone(),
        ));
        let catalog = Arc::new(CatalogService::new(
            store.clone(),
            breakers.clone(),
            config.allow_http_endpoints,
            config.allow_private_endpoints,
        ));

        Ok(Self {
            config,
            store,
            queue,
            breakers,
            ingest,
            processor,
            delivery,
            operator,
            catalog,
        })
    }

    /// Pipeline over in-process store, breaker state and queue.
    ///
    /// # Errors
    ///
    /// See [`Pipeline::new`].
    pub fn in_memory(config: DispatchConfig) -> Result<Self, WebhookError> {
        let queue = Arc::new(MemoryQueue::new(config.queue_lease()));
        Self::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryKvStore::new()),
            queue,
        )
    }

    #[must_use]
    pub fn app_state(&self) -> AppState {
        AppState {
            ingest: self.ingest.clone(),
            operator: self.operator.clone(),
            catalog: self.catalog.clone(),
            max_body_bytes: self.config.max_payload_bytes,
        }
    }

    /// HTTP router for ingestion and operator routes.
    #[must_use]
    pub fn router(&self) -> Router {
        api_router(self.app_state())
    }

    #[must_use]
    pub fn handler(&self) -> Arc<PipelineHandler> {
        Arc::new(PipelineHandler::new(
            self.processor.clone(),
            self.delivery.clone(),
        ))
    }

    /// Start the worker pool over both queues.
    #[must_use]
    pub fn start_workers(&self) -> WorkerHandle {
        WorkerPool::new(
            self.queue.clone(),
            self.handler(),
            WorkerPoolConfig {
                workers_per_queue: self.config.worker_count,
                poll_interval: self.config.poll_interval(),
                ..WorkerPoolConfig::default()
            },
        )
        .start()
    }

    /// Run due jobs inline until both queues have nothing due. Returns the
    /// number of jobs run.
    ///
    /// # Errors
    ///
    /// Returns the first queue error.
    pub async fn run_pending(&self) -> Result<usize, WebhookError> {
        let handler = self.handler();
        let mut ran = 0;
        loop {
            let mut progressed = false;
            for queue_name in [CREATE_EVENT_QUEUE, EVENT_DELIVERY_QUEUE] {
                while run_once(self.queue.as_ref(), handler.as_ref(), queue_name).await? {
                    ran += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(ran);
            }
        }
    }
}
