//! Dispatch tests against a wiremock receiver: request shape and signing,
//! retry scheduling, endpoint gates and subscription filtering.

mod common;

use chrono::Utc;
use common::*;
use hookrelay_dispatch::crypto::{verify_signature_header, HashAlgorithm, SignatureEncoding};
use hookrelay_dispatch::models::{
    DeliveryStatus, EndpointAuth, EventStatus, InboundRequest, RetryConfig, SubscriptionFilter,
};
use hookrelay_dispatch::retry::RetryStrategy;
use hookrelay_dispatch::services::NewEndpoint;
use hookrelay_dispatch::Store;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

fn linear(secs: u64, count: u32) -> RetryConfig {
    RetryConfig {
        strategy: RetryStrategy::Linear,
        duration_secs: secs,
        retry_count: count,
    }
}

fn exponential(secs: u64, count: u32) -> RetryConfig {
    RetryConfig {
        strategy: RetryStrategy::Exponential,
        duration_secs: secs,
        retry_count: count,
    }
}

async fn mount<R: wiremock::Respond + 'static>(server: &MockServer, responder: R) {
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(responder)
        .mount(server)
        .await;
}

// ---------------------------------------------------------------------------
// Request shape
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_delivery_is_signed_with_endpoint_secret() {
    let server = MockServer::start().await;
    let capture = CaptureResponder::new();
    mount(&server, capture.clone()).await;

    let harness = Harness::new().await;
    let source = harness.source().await;
    let endpoint = harness.endpoint(&format!("{}/hook", server.uri())).await;
    harness.subscribe(&source, &endpoint, linear(10, 3)).await;

    let body = br#"{"order":42}"#.to_vec();
    let outcome = harness
        .ingest(
            &source,
            InboundRequest::new(body.clone()).with_header("X-Event-Type", "order.created"),
        )
        .await
        .unwrap();
    harness.drain().await;

    let requests = capture.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.body, body);
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_eq!(request.header("user-agent"), Some("hookrelay/1.0"));
    assert_eq!(
        request.header("x-hookrelay-event-id"),
        Some(outcome.event.id.to_string().as_str())
    );
    assert_eq!(request.header("x-hookrelay-event-type"), Some("order.created"));

    let signature = request
        .header("x-hookrelay-signature")
        .expect("signature header");
    assert!(signature.starts_with("t="));
    assert!(verify_signature_header(
        signature,
        SECRET_1,
        &request.body,
        HashAlgorithm::Sha256,
        SignatureEncoding::Hex,
    ));
    assert!(!verify_signature_header(
        signature,
        SECRET_2,
        &request.body,
        HashAlgorithm::Sha256,
        SignatureEncoding::Hex,
    ));

    let delivery = harness.delivery_for(outcome.event.id).await;
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempts, 1);
    assert_eq!(
        request.header("x-hookrelay-delivery-id"),
        Some(delivery.id.to_string().as_str())
    );

    let attempts = harness.attempts(delivery.id).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(attempts[0].response_status, Some(200));
    assert!(!attempts[0].synthetic);
}

#[tokio::test]
async fn test_rotated_secret_signs_with_both_secrets() {
    let server = MockServer::start().await;
    let capture = CaptureResponder::new();
    mount(&server, capture.clone()).await;

    let harness = Harness::new().await;
    let source = harness.source().await;
    let endpoint = harness.endpoint(&format!("{}/hook", server.uri())).await;
    harness.subscribe(&source, &endpoint, linear(10, 3)).await;

    let rotated = harness
        .pipeline
        .catalog
        .rotate_endpoint_secret(harness.project_id(), endpoint.id, chrono::Duration::hours(1))
        .await
        .unwrap();

    harness.ingest_json(&source, json!({"n": 1})).await;
    harness.drain().await;

    let request = &capture.requests()[0];
    let signature = request.header("x-hookrelay-signature").unwrap();
    assert_eq!(signature.matches("v1=").count(), 2);
    for secret in [SECRET_1, rotated.value.as_str()] {
        assert!(verify_signature_header(
            signature,
            secret,
            &request.body,
            HashAlgorithm::Sha256,
            SignatureEncoding::Hex,
        ));
    }
}

#[tokio::test]
async fn test_api_key_is_sent_and_redacted_in_attempt_log() {
    let server = MockServer::start().await;
    let capture = CaptureResponder::new();
    mount(&server, capture.clone()).await;

    let harness = Harness::new().await;
    let source = harness.source().await;
    let endpoint = harness
        .endpoint_with(NewEndpoint {
            name: "keyed".to_string(),
            url: format!("{}/hook", server.uri()),
            secret: Some(SECRET_1.to_string()),
            auth: Some(EndpointAuth::ApiKey {
                header_name: "X-Api-Key".to_string(),
                header_value: "k-123".to_string(),
            }),
            http_timeout_secs: None,
        })
        .await;
    harness.subscribe(&source, &endpoint, linear(10, 3)).await;

    let event_id = harness.ingest_json(&source, json!({})).await;
    harness.drain().await;

    assert_eq!(capture.requests()[0].header("x-api-key"), Some("k-123"));

    let delivery = harness.delivery_for(event_id).await;
    let attempts = harness.attempts(delivery.id).await;
    assert_eq!(
        attempts[0].request_headers.get("x-api-key").map(String::as_str),
        Some("[redacted]")
    );
}

#[tokio::test]
async fn test_response_body_is_truncated() {
    let server = MockServer::start().await;
    mount(&server, CaptureResponder::new().with_body("x".repeat(10_000))).await;

    let harness = Harness::new().await;
    let source = harness.source().await;
    let endpoint = harness.endpoint(&format!("{}/hook", server.uri())).await;
    harness.subscribe(&source, &endpoint, linear(10, 3)).await;

    let event_id = harness.ingest_json(&source, json!({})).await;
    harness.drain().await;

    let delivery = harness.delivery_for(event_id).await;
    let attempts = harness.attempts(delivery.id).await;
    let body = attempts[0].response_body.as_deref().unwrap();
    assert_eq!(body.len(), harness.pipeline.config.max_response_bytes);
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failing_endpoint_is_retried_until_limit() {
    let server = MockServer::start().await;
    let counter = CountingResponder::with_status(500);
    mount(&server, counter.clone()).await;

    let harness = Harness::new().await;
    let source = harness.source().await;
    let endpoint = harness.endpoint(&format!("{}/hook", server.uri())).await;
    harness.subscribe(&source, &endpoint, linear(1, 3)).await;

    let event_id = harness.ingest_json(&source, json!({})).await;
    harness.settle(10).await;

    assert_eq!(counter.count(), 3);
    let delivery = harness.delivery_for(event_id).await;
    assert_eq!(delivery.status, DeliveryStatus::Failure);
    assert_eq!(delivery.attempts, 3);
    assert!(delivery.next_attempt_at.is_none());
    assert!(delivery.last_error.unwrap().contains("500"));

    let attempts = harness.attempts(delivery.id).await;
    let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(attempts.iter().all(|a| a.response_status == Some(500)));
}

#[tokio::test]
async fn test_recovering_endpoint_succeeds_on_retry() {
    let server = MockServer::start().await;
    let responder = FailingResponder::fail_times(2);
    mount(&server, responder.clone()).await;

    let harness = Harness::new().await;
    let source = harness.source().await;
    let endpoint = harness.endpoint(&format!("{}/hook", server.uri())).await;
    harness.subscribe(&source, &endpoint, exponential(1, 5)).await;

    let event_id = harness.ingest_json(&source, json!({})).await;
    harness.settle(10).await;

    assert_eq!(responder.attempt_count(), 3);
    let delivery = harness.delivery_for(event_id).await;
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempts, 3);
    assert!(delivery.last_error.is_none());
}

#[tokio::test]
async fn test_exponential_backoff_doubles_each_attempt() {
    let server = MockServer::start().await;
    mount(&server, CountingResponder::with_status(503)).await;

    let harness = Harness::new().await;
    let source = harness.source().await;
    let endpoint = harness.endpoint(&format!("{}/hook", server.uri())).await;
    harness.subscribe(&source, &endpoint, exponential(10, 5)).await;

    let event_id = harness.ingest_json(&source, json!({})).await;
    harness.drain().await;

    let delivery = harness.delivery_for(event_id).await;
    assert_eq!(delivery.status, DeliveryStatus::Scheduled);
    assert_eq!(delivery.attempts, 1);
    let wait = (delivery.next_attempt_at.unwrap() - Utc::now()).num_seconds();
    assert!((8..=10).contains(&wait), "first wait was {wait}s");

    harness.drain_retries().await;
    let delivery = harness.delivery(delivery.id).await;
    assert_eq!(delivery.attempts, 2);
    let wait = (delivery.next_attempt_at.unwrap() - Utc::now()).num_seconds();
    assert!((18..=20).contains(&wait), "second wait was {wait}s");
}

#[tokio::test]
async fn test_linear_backoff_keeps_interval() {
    let server = MockServer::start().await;
    mount(&server, CountingResponder::with_status(503)).await;

    let harness = Harness::new().await;
    let source = harness.source().await;
    let endpoint = harness.endpoint(&format!("{}/hook", server.uri())).await;
    harness.subscribe(&source, &endpoint, linear(10, 5)).await;

    let event_id = harness.ingest_json(&source, json!({})).await;
    harness.drain().await;
    harness.drain_retries().await;

    let delivery = harness.delivery_for(event_id).await;
    assert_eq!(delivery.attempts, 2);
    let wait = (delivery.next_attempt_at.unwrap() - Utc::now()).num_seconds();
    assert!((8..=10).contains(&wait), "wait was {wait}s");
}

// ---------------------------------------------------------------------------
// Endpoint gates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_paused_endpoint_fails_delivery_without_request() {
    let server = MockServer::start().await;
    let counter = CountingResponder::new();
    mount(&server, counter.clone()).await;

    let harness = Harness::new().await;
    let source = harness.source().await;
    let endpoint = harness.endpoint(&format!("{}/hook", server.uri())).await;
    harness.subscribe(&source, &endpoint, linear(1, 5)).await;
    harness
        .pipeline
        .catalog
        .pause_endpoint(harness.project_id(), endpoint.id)
        .await
        .unwrap();

    let event_id = harness.ingest_json(&source, json!({})).await;
    harness.drain().await;

    assert_eq!(counter.count(), 0);
    let delivery = harness.delivery_for(event_id).await;
    assert_eq!(delivery.status, DeliveryStatus::Failure);
    assert_eq!(delivery.attempts, 1);

    let attempts = harness.attempts(delivery.id).await;
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].synthetic);
    assert_eq!(attempts[0].error.as_deref(), Some("Endpoint is paused"));
}

#[tokio::test]
async fn test_deleted_endpoint_discards_pending_delivery() {
    let server = MockServer::start().await;
    let counter = CountingResponder::with_status(500);
    mount(&server, counter.clone()).await;

    let harness = Harness::new().await;
    let source = harness.source().await;
    let endpoint = harness.endpoint(&format!("{}/hook", server.uri())).await;
    harness.subscribe(&source, &endpoint, linear(1, 5)).await;

    let event_id = harness.ingest_json(&source, json!({})).await;
    harness.drain().await;
    let delivery = harness.delivery_for(event_id).await;
    assert_eq!(delivery.status, DeliveryStatus::Scheduled);

    harness
        .pipeline
        .catalog
        .delete_endpoint(harness.project_id(), endpoint.id)
        .await
        .unwrap();
    harness.drain_retries().await;

    assert_eq!(counter.count(), 1);
    let delivery = harness.delivery(delivery.id).await;
    assert_eq!(delivery.status, DeliveryStatus::Discarded);
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_event_fans_out_to_every_matching_subscription() {
    let server = MockServer::start().await;
    let counter = CountingResponder::new();
    mount(&server, counter.clone()).await;

    let harness = Harness::new().await;
    let source = harness.source().await;
    let first = harness.endpoint(&format!("{}/hook", server.uri())).await;
    let second = harness.endpoint(&format!("{}/hook", server.uri())).await;
    harness.subscribe(&source, &first, linear(1, 3)).await;
    harness.subscribe(&source, &second, linear(1, 3)).await;

    let event_id = harness.ingest_json(&source, json!({})).await;
    harness.drain().await;

    assert_eq!(counter.count(), 2);
    let deliveries = harness.deliveries_for_event(event_id).await;
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries
        .iter()
        .all(|d| d.status == DeliveryStatus::Success));

    let event = harness
        .pipeline
        .store
        .get_event(harness.project_id(), event_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.status, EventStatus::Processed);
    assert_eq!(event.endpoint_ids.len(), 2);
}

#[tokio::test]
async fn test_filters_select_by_event_type_and_body() {
    let server = MockServer::start().await;
    let capture = CaptureResponder::new();
    mount(&server, capture.clone()).await;

    let harness = Harness::new().await;
    let source = harness.source().await;
    let endpoint = harness.endpoint(&format!("{}/hook", server.uri())).await;
    harness
        .subscribe_with(
            &source,
            &endpoint,
            SubscriptionFilter::default()
                .with_event_types(&["order.created"])
                .with_body(json!({"region": "eu"})),
            linear(1, 3),
        )
        .await;

    let send = |event_type: &'static str, body: serde_json::Value| {
        InboundRequest::new(serde_json::to_vec(&body).unwrap())
            .with_header("X-Event-Type", event_type)
    };

    let matched = harness
        .ingest(&source, send("order.created", json!({"region": "eu", "n": 1})))
        .await
        .unwrap()
        .event
        .id;
    let wrong_type = harness
        .ingest(&source, send("order.deleted", json!({"region": "eu"})))
        .await
        .unwrap()
        .event
        .id;
    let wrong_body = harness
        .ingest(&source, send("order.created", json!({"region": "us"})))
        .await
        .unwrap()
        .event
        .id;
    harness.drain().await;

    assert_eq!(capture.request_count(), 1);
    assert_eq!(harness.deliveries_for_event(matched).await.len(), 1);
    for unmatched in [wrong_type, wrong_body] {
        assert!(harness.deliveries_for_event(unmatched).await.is_empty());
        let event = harness
            .pipeline
            .store
            .get_event(harness.project_id(), unmatched)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, EventStatus::Failure);
    }
}
