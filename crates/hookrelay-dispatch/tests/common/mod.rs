//! Common test utilities for hookrelay-dispatch integration tests.
//!
//! Provides wiremock responders, a pipeline harness over the in-memory
//! backends and a queue wrapper that fails chosen enqueues.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookrelay_dispatch::circuit_breaker::CircuitBreakerConfig;
use hookrelay_dispatch::crypto::{compute_hmac, HashAlgorithm};
use hookrelay_dispatch::models::{
    DeliveryAttempt, DeliveryFilter, Endpoint, EventDelivery, InboundRequest, Project, Source,
    Subscription, SubscriptionFilter, RetryConfig,
};
use hookrelay_dispatch::queue::{Job, JobQueue, Lease, MemoryQueue, EVENT_DELIVERY_QUEUE};
use hookrelay_dispatch::services::{IngestOutcome, NewEndpoint, NewSource, NewSubscription};
use hookrelay_dispatch::store::MemoryStore;
use hookrelay_dispatch::{DispatchConfig, MemoryKvStore, Pipeline, WebhookError};
use uuid::Uuid;
use wiremock::{Request, Respond, ResponseTemplate};

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

/// Standard endpoint secrets
pub const SECRET_1: &str = "whsec_test_secret_key_12345";
pub const SECRET_2: &str = "whsec_another_secret_67890";

/// Secret shared with producers for HMAC-verified sources
pub const SOURCE_SECRET: &str = "src_test_secret";

/// Config that accepts wiremock's plain-HTTP loopback URLs.
pub fn test_config() -> DispatchConfig {
    DispatchConfig {
        allow_http_endpoints: true,
        allow_private_endpoints: true,
        http_timeout_secs: 5,
        ..DispatchConfig::default()
    }
}

/// Breaker that trips after `n` consecutive failures and waits
/// `error_timeout` seconds before probing.
pub fn consecutive_breaker(n: u32, error_timeout: u64) -> CircuitBreakerConfig {
    CircuitBreakerConfig::default()
        .with_consecutive_failure_threshold(n)
        .with_error_timeout(error_timeout)
}

/// Hex HMAC-SHA256 of `body`, as producers sign HMAC sources.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    hex::encode(compute_hmac(HashAlgorithm::Sha256, secret.as_bytes(), &[body]))
}

// ---------------------------------------------------------------------------
// Harness - pipeline over in-memory backends with one project
// ---------------------------------------------------------------------------

pub struct Harness {
    pub pipeline: Pipeline,
    /// The memory queue under the pipeline, for releasing delayed retries.
    pub memory_queue: Arc<MemoryQueue>,
    pub project: Project,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_breaker(CircuitBreakerConfig::default()).await
    }

    pub async fn with_breaker(breaker: CircuitBreakerConfig) -> Self {
        let memory_queue = Arc::new(MemoryQueue::default());
        Self::build(breaker, memory_queue.clone(), memory_queue).await
    }

    /// Harness whose pipeline enqueues through `queue`.
    pub async fn with_queue(queue: Arc<FailingQueue>) -> Self {
        let memory_queue = queue.inner.clone();
        Self::build(CircuitBreakerConfig::default(), queue, memory_queue).await
    }

    async fn build(
        breaker: CircuitBreakerConfig,
        queue: Arc<dyn JobQueue>,
        memory_queue: Arc<MemoryQueue>,
    ) -> Self {
        let pipeline = Pipeline::new(
            test_config(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryKvStore::new()),
            queue,
        )
        .unwrap();
        let project = pipeline
            .catalog
            .create_project(Project::new("test-project").with_breaker(breaker))
            .await
            .unwrap();
        Self {
            pipeline,
            memory_queue,
            project,
        }
    }

    pub fn project_id(&self) -> Uuid {
        self.project.id
    }

    /// Unauthenticated HTTP source.
    pub async fn source(&self) -> Source {
        self.source_with(NewSource {
            name: "orders".to_string(),
            mask_id: None,
            source_type: Default::default(),
            verifier: Default::default(),
            idempotency_keys: Vec::new(),
            custom_response: None,
            body_limit_bytes: None,
        })
        .await
    }

    pub async fn source_with(&self, input: NewSource) -> Source {
        self.pipeline
            .catalog
            .create_source(self.project_id(), input)
            .await
            .unwrap()
    }

    /// Endpoint signed with [`SECRET_1`].
    pub async fn endpoint(&self, url: &str) -> Endpoint {
        self.endpoint_with(NewEndpoint {
            name: "receiver".to_string(),
            url: url.to_string(),
            secret: Some(SECRET_1.to_string()),
            auth: None,
            http_timeout_secs: None,
        })
        .await
    }

    pub async fn endpoint_with(&self, input: NewEndpoint) -> Endpoint {
        self.pipeline
            .catalog
            .create_endpoint(self.project_id(), input)
            .await
            .unwrap()
    }

    pub async fn subscribe(
        &self,
        source: &Source,
        endpoint: &Endpoint,
        retry: RetryConfig,
    ) -> Subscription {
        self.subscribe_with(source, endpoint, SubscriptionFilter::default(), retry)
            .await
    }

    pub async fn subscribe_with(
        &self,
        source: &Source,
        endpoint: &Endpoint,
        filter: SubscriptionFilter,
        retry: RetryConfig,
    ) -> Subscription {
        self.pipeline
            .catalog
            .create_subscription(
                self.project_id(),
                NewSubscription {
                    name: format!("to-{}", endpoint.name),
                    source_id: Some(source.id),
                    endpoint_id: endpoint.id,
                    filter,
                    retry,
                    alert: Default::default(),
                },
            )
            .await
            .unwrap()
    }

    pub async fn ingest(
        &self,
        source: &Source,
        request: InboundRequest,
    ) -> Result<IngestOutcome, WebhookError> {
        self.pipeline.ingest.ingest(&source.mask_id, request).await
    }

    /// Ingest a JSON body and return the event id.
    pub async fn ingest_json(&self, source: &Source, body: serde_json::Value) -> Uuid {
        let request = InboundRequest::new(serde_json::to_vec(&body).unwrap());
        self.ingest(source, request).await.unwrap().event.id
    }

    /// Run every due job.
    pub async fn drain(&self) -> usize {
        self.pipeline.run_pending().await.unwrap()
    }

    /// Make scheduled retries due, then run them.
    pub async fn drain_retries(&self) -> usize {
        self.memory_queue.release_delayed(EVENT_DELIVERY_QUEUE).await;
        self.drain().await
    }

    /// Drive retries until no delivery job is left, up to `rounds` rounds.
    pub async fn settle(&self, rounds: usize) {
        self.drain().await;
        for _ in 0..rounds {
            if self
                .memory_queue
                .len(EVENT_DELIVERY_QUEUE)
                .await
                .unwrap()
                == 0
            {
                return;
            }
            self.drain_retries().await;
        }
    }

    pub async fn deliveries_for_event(&self, event_id: Uuid) -> Vec<EventDelivery> {
        self.pipeline
            .operator
            .list_deliveries(
                self.project_id(),
                &DeliveryFilter {
                    event_id: Some(event_id),
                    ..DeliveryFilter::default()
                },
            )
            .await
            .unwrap()
    }

    /// The single delivery created for `event_id`.
    pub async fn delivery_for(&self, event_id: Uuid) -> EventDelivery {
        let mut deliveries = self.deliveries_for_event(event_id).await;
        assert_eq!(deliveries.len(), 1, "expected exactly one delivery");
        deliveries.remove(0)
    }

    pub async fn delivery(&self, delivery_id: Uuid) -> EventDelivery {
        self.pipeline
            .operator
            .get_delivery(self.project_id(), delivery_id)
            .await
            .unwrap()
    }

    pub async fn attempts(&self, delivery_id: Uuid) -> Vec<DeliveryAttempt> {
        self.pipeline
            .operator
            .list_attempts(self.project_id(), delivery_id)
            .await
            .unwrap()
    }
}

// ---------------------------------------------------------------------------
// FailingQueue - rejects dispatch enqueues for chosen deliveries
// ---------------------------------------------------------------------------

/// Delegates to a [`MemoryQueue`] but fails enqueueing dispatch jobs for
/// the deliveries in its fail set.
pub struct FailingQueue {
    inner: Arc<MemoryQueue>,
    fail_for: Mutex<HashSet<Uuid>>,
}

impl FailingQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryQueue::default()),
            fail_for: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_delivery(&self, delivery_id: Uuid) {
        self.fail_for.lock().unwrap().insert(delivery_id);
    }

    pub fn clear(&self) {
        self.fail_for.lock().unwrap().clear();
    }
}

impl Default for FailingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for FailingQueue {
    async fn enqueue(&self, job: Job, run_at: Option<DateTime<Utc>>) -> Result<(), WebhookError> {
        if let Job::DispatchDelivery(dispatch) = &job {
            if self.fail_for.lock().unwrap().contains(&dispatch.delivery_id) {
                return Err(WebhookError::Queue("injected enqueue failure".to_string()));
            }
        }
        self.inner.enqueue(job, run_at).await
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Lease>, WebhookError> {
        self.inner.dequeue(queue).await
    }

    async fn ack(&self, lease: &Lease) -> Result<(), WebhookError> {
        self.inner.ack(lease).await
    }

    async fn nack(
        &self,
        lease: &Lease,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), WebhookError> {
        self.inner.nack(lease, retry_at).await
    }

    async fn len(&self, queue: &str) -> Result<usize, WebhookError> {
        self.inner.len(queue).await
    }
}

// ---------------------------------------------------------------------------
// CapturedRequest - for inspecting webhook requests
// ---------------------------------------------------------------------------

/// A captured HTTP request with body and headers.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl CapturedRequest {
    pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == name_lower)
            .map(|(_, v)| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// CaptureResponder - captures requests and returns a fixed status
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CaptureResponder {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    response_code: u16,
    response_body: Option<String>,
}

impl CaptureResponder {
    /// Create a new capture responder that returns 200 OK.
    pub fn new() -> Self {
        Self::with_status(200)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_code: status,
            response_body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.response_body = Some(body.into());
        self
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Default for CaptureResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Respond for CaptureResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let captured = CapturedRequest {
            body: request.body.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect(),
            timestamp: Utc::now(),
        };
        self.requests.lock().unwrap().push(captured);
        let template = ResponseTemplate::new(self.response_code);
        match &self.response_body {
            Some(body) => template.set_body_string(body.clone()),
            None => template,
        }
    }
}

// ---------------------------------------------------------------------------
// CountingResponder - counts requests
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CountingResponder {
    count: Arc<AtomicU32>,
    response_code: u16,
}

impl CountingResponder {
    pub fn new() -> Self {
        Self::with_status(200)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            count: Arc::new(AtomicU32::new(0)),
            response_code: status,
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Default for CountingResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Respond for CountingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.count.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(self.response_code)
    }
}

// ---------------------------------------------------------------------------
// FailingResponder - fails N times then succeeds
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FailingResponder {
    attempt_count: Arc<AtomicU32>,
    failures_before_success: u32,
    failure_code: u16,
    success_code: u16,
}

impl FailingResponder {
    /// Create a responder that fails `n` times with 500, then returns 200.
    pub fn fail_times(n: u32) -> Self {
        Self::fail_with_status(n, 500)
    }

    pub fn fail_with_status(n: u32, failure_code: u16) -> Self {
        Self {
            attempt_count: Arc::new(AtomicU32::new(0)),
            failures_before_success: n,
            failure_code,
            success_code: 200,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }
}

impl Respond for FailingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.attempt_count.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            ResponseTemplate::new(self.failure_code)
        } else {
            ResponseTemplate::new(self.success_code)
        }
    }
}
