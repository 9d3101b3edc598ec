//! Webhook dispatch.
//!
//! Runs one attempt of an [`EventDelivery`] per dispatch job:
//! - circuit breaker admission for the endpoint (skipped for forced resends)
//! - endpoint status gate: paused and inactive endpoints fail the delivery
//! - signed HTTP POST with optional API key or OAuth2 authentication
//! - bounded response capture into an append-only [`DeliveryAttempt`]
//! - breaker bookkeeping and the retry or terminal decision
//!
//! Endpoint failures never surface as errors from [`DeliveryService::process`];
//! only store and queue failures do, and the worker redelivers those jobs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use tracing::instrument;
use uuid::Uuid;

use crate::circuit_breaker::{Admission, CircuitBreakerManager};
use crate::config::DispatchConfig;
use crate::crypto;
use crate::error::WebhookError;
use crate::models::{
    DeliveryAttempt, DeliveryStatus, Endpoint, EndpointAuth, EndpointStatus, Event,
    EventDelivery, Project,
};
use crate::queue::{DispatchJob, Job, JobQueue};
use crate::retry::{next_attempt, RetryDecision};
use crate::services::event_processing::dispatch_job;
use crate::services::token_service::TokenService;
use crate::store::Store;

pub const USER_AGENT: &str = "hookrelay/1.0";

pub const EVENT_ID_HEADER: &str = "X-Hookrelay-Event-Id";
pub const DELIVERY_ID_HEADER: &str = "X-Hookrelay-Delivery-Id";
pub const EVENT_TYPE_HEADER: &str = "X-Hookrelay-Event-Type";
pub const TIMESTAMP_HEADER: &str = "X-Hookrelay-Timestamp";

const REDACTED: &str = "[redacted]";

/// What one dispatch job did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The endpoint answered 2xx.
    Delivered,
    /// The attempt failed and another is scheduled.
    Retrying { next_attempt_at: DateTime<Utc> },
    /// The attempt failed and the delivery is terminally failed.
    Failed,
    /// The breaker rejected the attempt without a network call.
    ShortCircuited { next_attempt_at: Option<DateTime<Utc>> },
    /// The event, endpoint or project is gone.
    Discarded,
    /// The job was stale or the delivery is already terminal.
    Skipped,
}

/// Build the shared outbound HTTP client.
///
/// # Errors
///
/// Returns `WebhookError::Internal` if the HTTP client cannot be built.
pub fn build_http_client(timeout: Duration) -> Result<Client, WebhookError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| WebhookError::Internal(format!("Failed to build HTTP client: {e}")))
}

/// Result of one HTTP push, before it is persisted.
#[derive(Debug, Default)]
struct PushResult {
    request_headers: BTreeMap<String, String>,
    response_status: Option<u16>,
    response_headers: BTreeMap<String, String>,
    response_body: Option<String>,
    error: Option<String>,
    latency_ms: Option<u64>,
    /// Whether the endpoint itself produced the outcome. Token exchange
    /// failures never reach it and do not feed the breaker.
    reached_endpoint: bool,
}

impl PushResult {
    fn is_success(&self) -> bool {
        self.error.is_none() && self.response_status.is_some_and(|s| (200..300).contains(&s))
    }

    fn failure_reason(&self) -> String {
        match (&self.error, self.response_status) {
            (Some(error), _) => error.clone(),
            (None, Some(status)) => format!("HTTP {status}"),
            (None, None) => "No response".to_string(),
        }
    }
}

pub struct DeliveryService {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    breakers: Arc<CircuitBreakerManager>,
    tokens: Arc<TokenService>,
    http_client: Client,
    default_timeout: Duration,
    max_response_bytes: usize,
    max_retry_delay: Duration,
}

impl DeliveryService {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        breakers: Arc<CircuitBreakerManager>,
        tokens: Arc<TokenService>,
        http_client: Client,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            store,
            queue,
            breakers,
            tokens,
            http_client,
            default_timeout: config.http_timeout(),
            max_response_bytes: config.max_response_bytes,
            max_retry_delay: config.max_retry_delay(),
        }
    }

    /// Run one dispatch job.
    #[instrument(skip(self, job), fields(delivery_id = %job.delivery_id, attempt = job.attempt))]
    pub async fn process(&self, job: &DispatchJob) -> Result<DispatchOutcome, WebhookError> {
        let Some(mut delivery) = self
            .store
            .get_delivery(job.project_id, job.delivery_id)
            .await?
        else {
            tracing::warn!(
                target: "webhook_delivery",
                delivery_id = %job.delivery_id,
                "Dispatch job references a missing delivery"
            );
            return Ok(DispatchOutcome::Skipped);
        };

        // Terminal deliveries and jobs overtaken by a later attempt are
        // duplicates from at-least-once redelivery.
        if delivery.status.is_terminal() || job.attempt < delivery.attempts {
            tracing::debug!(
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                status = delivery.status.as_str(),
                job_attempt = job.attempt,
                attempts = delivery.attempts,
                "Skipping stale dispatch job"
            );
            return Ok(DispatchOutcome::Skipped);
        }

        let Some((event, endpoint, project)) = self.load_context(&delivery).await? else {
            delivery.status = DeliveryStatus::Discarded;
            delivery.next_attempt_at = None;
            delivery.last_error = Some("Event, endpoint or project no longer exists".to_string());
            delivery.updated_at = Utc::now();
            self.store.update_delivery(&delivery).await?;
            tracing::info!(
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                "Delivery discarded"
            );
            return Ok(DispatchOutcome::Discarded);
        };

        if endpoint.status != EndpointStatus::Active {
            let reason = match endpoint.status {
                EndpointStatus::Paused => "Endpoint is paused",
                _ => "Endpoint is inactive",
            };
            self.record_synthetic(&delivery, reason).await?;
            delivery.attempts += 1;
            return self.finish_terminal(delivery, reason.to_string()).await;
        }

        delivery.status = DeliveryStatus::Processing;
        delivery.updated_at = Utc::now();
        self.store.update_delivery(&delivery).await?;

        if !job.force {
            let admission = match self
                .breakers
                .admit(project.id, endpoint.id, &project.breaker)
                .await
            {
                Ok(admission) => admission,
                Err(e) => {
                    // Breaker store outages fail open.
                    tracing::error!(
                        target: "webhook_delivery",
                        delivery_id = %delivery.id,
                        endpoint_id = %endpoint.id,
                        error = %e,
                        "Failed to check circuit breaker status"
                    );
                    Admission::Allowed
                }
            };

            if let Admission::Rejected { retry_at } = admission {
                tracing::warn!(
                    target: "webhook_delivery",
                    delivery_id = %delivery.id,
                    endpoint_id = %endpoint.id,
                    retry_at = %retry_at,
                    "Delivery rejected - circuit breaker is open"
                );
                let reason = "Circuit breaker open - endpoint temporarily unavailable";
                self.record_synthetic(&delivery, reason).await?;
                delivery.attempts += 1;
                let outcome = self
                    .schedule_next(delivery, reason.to_string(), Some(retry_at))
                    .await?;
                return Ok(match outcome {
                    DispatchOutcome::Retrying { next_attempt_at } => {
                        DispatchOutcome::ShortCircuited {
                            next_attempt_at: Some(next_attempt_at),
                        }
                    }
                    _ => DispatchOutcome::ShortCircuited {
                        next_attempt_at: None,
                    },
                });
            }
        }

        let push = self.push(&delivery, &event, &endpoint, &project).await;
        let success = push.is_success();
        let reason = push.failure_reason();
        let latency_ms = push.latency_ms;
        let response_status = push.response_status;
        let reached_endpoint = push.reached_endpoint;

        self.store
            .insert_attempt(&self.attempt_record(&delivery, &event, push))
            .await?;
        delivery.attempts += 1;

        if reached_endpoint {
            if let Err(e) = self
                .breakers
                .record_outcome(project.id, endpoint.id, &project.breaker, success)
                .await
            {
                tracing::error!(
                    target: "webhook_delivery",
                    endpoint_id = %endpoint.id,
                    error = %e,
                    "Failed to record outcome to circuit breaker"
                );
            }
        }

        if success {
            tracing::info!(
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                event_id = %delivery.event_id,
                endpoint_id = %endpoint.id,
                response_code = response_status,
                latency_ms,
                attempt_number = delivery.attempts,
                "Webhook delivery succeeded"
            );
            delivery.status = DeliveryStatus::Success;
            delivery.next_attempt_at = None;
            delivery.last_error = None;
            delivery.updated_at = Utc::now();
            self.store.update_delivery(&delivery).await?;
            return Ok(DispatchOutcome::Delivered);
        }

        tracing::warn!(
            target: "webhook_delivery",
            delivery_id = %delivery.id,
            event_id = %delivery.event_id,
            endpoint_id = %endpoint.id,
            error = %reason,
            attempt_number = delivery.attempts,
            "Webhook delivery failed"
        );
        self.schedule_next(delivery, reason, None).await
    }

    async fn load_context(
        &self,
        delivery: &EventDelivery,
    ) -> Result<Option<(Event, Endpoint, Project)>, WebhookError> {
        let project_id = delivery.project_id;
        let Some(event) = self.store.get_event(project_id, delivery.event_id).await? else {
            return Ok(None);
        };
        let Some(endpoint) = self
            .store
            .get_endpoint(project_id, delivery.endpoint_id)
            .await?
        else {
            return Ok(None);
        };
        let Some(project) = self.store.get_project(project_id).await? else {
            return Ok(None);
        };
        Ok(Some((event, endpoint, project)))
    }

    /// Retry or fail after an unsuccessful attempt. `not_before` holds the
    /// next attempt back until the breaker lets a trial request through.
    async fn schedule_next(
        &self,
        mut delivery: EventDelivery,
        reason: String,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<DispatchOutcome, WebhookError> {
        let now = Utc::now();
        match next_attempt(&delivery.metadata, delivery.attempts, self.max_retry_delay, now) {
            RetryDecision::Exhausted => self.finish_terminal(delivery, reason).await,
            RetryDecision::Retry { at } => {
                let at = not_before.map_or(at, |floor| at.max(floor));
                delivery.status = DeliveryStatus::Scheduled;
                delivery.next_attempt_at = Some(at);
                delivery.last_error = Some(reason);
                delivery.updated_at = now;

                // Enqueue before persisting: if the update fails, the job
                // still carries the retry.
                self.queue
                    .enqueue(Job::DispatchDelivery(dispatch_job(&delivery, false)), Some(at))
                    .await?;
                self.store.update_delivery(&delivery).await?;

                tracing::info!(
                    target: "webhook_delivery",
                    delivery_id = %delivery.id,
                    attempts = delivery.attempts,
                    retry_limit = delivery.metadata.retry_limit,
                    next_attempt_at = %at,
                    "Scheduled delivery retry"
                );
                Ok(DispatchOutcome::Retrying { next_attempt_at: at })
            }
        }
    }

    async fn finish_terminal(
        &self,
        mut delivery: EventDelivery,
        reason: String,
    ) -> Result<DispatchOutcome, WebhookError> {
        tracing::warn!(
            target: "webhook_delivery",
            delivery_id = %delivery.id,
            event_id = %delivery.event_id,
            attempts = delivery.attempts,
            error = %reason,
            "Delivery failed terminally, eligible for manual resend"
        );
        delivery.status = DeliveryStatus::Failure;
        delivery.next_attempt_at = None;
        delivery.last_error = Some(reason);
        delivery.updated_at = Utc::now();
        self.store.update_delivery(&delivery).await?;
        Ok(DispatchOutcome::Failed)
    }

    /// Attempt record for an attempt that never went out.
    async fn record_synthetic(
        &self,
        delivery: &EventDelivery,
        reason: &str,
    ) -> Result<(), WebhookError> {
        let attempt = DeliveryAttempt {
            id: Uuid::new_v4(),
            delivery_id: delivery.id,
            project_id: delivery.project_id,
            endpoint_id: delivery.endpoint_id,
            attempt_number: delivery.attempts + 1,
            request_headers: BTreeMap::new(),
            request_body: String::new(),
            response_status: None,
            response_headers: BTreeMap::new(),
            response_body: None,
            error: Some(reason.to_string()),
            synthetic: true,
            latency_ms: None,
            created_at: Utc::now(),
        };
        self.store.insert_attempt(&attempt).await
    }

    fn attempt_record(
        &self,
        delivery: &EventDelivery,
        event: &Event,
        push: PushResult,
    ) -> DeliveryAttempt {
        DeliveryAttempt {
            id: Uuid::new_v4(),
            delivery_id: delivery.id,
            project_id: delivery.project_id,
            endpoint_id: delivery.endpoint_id,
            attempt_number: delivery.attempts + 1,
            request_headers: push.request_headers,
            request_body: String::from_utf8_lossy(&event.payload).into_owned(),
            response_status: push.response_status,
            response_headers: push.response_headers,
            response_body: push.response_body,
            error: push.error,
            synthetic: false,
            latency_ms: push.latency_ms,
            created_at: Utc::now(),
        }
    }

    /// Build, sign and send the request. Never fails; every problem lands in
    /// the returned [`PushResult`].
    async fn push(
        &self,
        delivery: &EventDelivery,
        event: &Event,
        endpoint: &Endpoint,
        project: &Project,
    ) -> PushResult {
        let now = Utc::now();
        let timestamp = now.timestamp().to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        insert_header(&mut headers, EVENT_ID_HEADER, &event.id.to_string());
        insert_header(&mut headers, DELIVERY_ID_HEADER, &delivery.id.to_string());
        insert_header(&mut headers, EVENT_TYPE_HEADER, &event.event_type);
        insert_header(&mut headers, TIMESTAMP_HEADER, &timestamp);

        let secrets = endpoint.active_secrets(now);
        if !secrets.is_empty() {
            let signature = crypto::build_signature_header(
                &secrets,
                &timestamp,
                &event.payload,
                project.signature.hash,
                project.signature.encoding,
            );
            insert_header(&mut headers, &project.signature.header, &signature);
        }

        let mut redacted_header = None;
        match &endpoint.auth {
            None => {}
            Some(EndpointAuth::ApiKey {
                header_name,
                header_value,
            }) => {
                insert_header(&mut headers, header_name, header_value);
                redacted_header = Some(header_name.to_ascii_lowercase());
            }
            Some(EndpointAuth::OAuth2(config)) => {
                match self.tokens.get_token(endpoint.id, config).await {
                    Ok(token) => {
                        insert_header(&mut headers, "Authorization", &format!("Bearer {token}"));
                        redacted_header = Some("authorization".to_string());
                    }
                    Err(e) => {
                        tracing::warn!(
                            target: "webhook_delivery",
                            delivery_id = %delivery.id,
                            endpoint_id = %endpoint.id,
                            error = %e,
                            "OAuth2 token exchange failed"
                        );
                        return PushResult {
                            request_headers: headers_to_map(&headers, None),
                            error: Some(format!("OAuth2 token exchange failed: {e}")),
                            ..PushResult::default()
                        };
                    }
                }
            }
        }

        let request_headers = headers_to_map(&headers, redacted_header.as_deref());
        let timeout = endpoint
            .http_timeout_secs
            .map_or(self.default_timeout, Duration::from_secs);

        let start = Instant::now();
        let result = self
            .http_client
            .post(&endpoint.url)
            .headers(headers)
            .timeout(timeout)
            .body(event.payload.clone())
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                let response_headers = headers_to_map(response.headers(), None);
                let (body, read_error) = read_bounded(response, self.max_response_bytes).await;
                PushResult {
                    request_headers,
                    response_status: Some(status),
                    response_headers,
                    response_body: Some(body),
                    error: read_error,
                    latency_ms: Some(elapsed_ms(start)),
                    reached_endpoint: true,
                }
            }
            Err(e) => {
                let error = if e.is_timeout() {
                    format!("Request timeout ({}s)", timeout.as_secs())
                } else if e.is_connect() {
                    format!("Connection failed: {e}")
                } else {
                    format!("Request error: {e}")
                };
                PushResult {
                    request_headers,
                    error: Some(error),
                    latency_ms: Some(elapsed_ms(start)),
                    reached_endpoint: true,
                    ..PushResult::default()
                }
            }
        }
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Read at most `limit` bytes of the body. A body cut short by a timeout or
/// reset is reported as an error alongside what was read.
async fn read_bounded(mut response: reqwest::Response, limit: usize) -> (String, Option<String>) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = limit.saturating_sub(buf.len());
                if chunk.len() >= remaining {
                    buf.extend_from_slice(&chunk[..remaining]);
                    break;
                }
                buf.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => {
                let error = if e.is_timeout() {
                    "Response body read timed out".to_string()
                } else {
                    format!("Response body read failed: {e}")
                };
                return (String::from_utf8_lossy(&buf).into_owned(), Some(error));
            }
        }
    }
    (String::from_utf8_lossy(&buf).into_owned(), None)
}

/// Convert HTTP headers to a map, masking the credential header.
fn headers_to_map(headers: &HeaderMap, redact: Option<&str>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if redact == Some(name.as_str()) {
                REDACTED.to_string()
            } else {
                value.to_str().unwrap_or("").to_string()
            };
            (name.as_str().to_string(), value)
        })
        .collect()
}
