//! Full pipeline runs: a signed producer request goes through ingestion,
//! matching and dispatch against a receiver that fails before recovering.

mod common;

use std::time::Duration;

use common::*;
use hookrelay_dispatch::crypto::{verify_signature_header, HashAlgorithm, SignatureEncoding};
use hookrelay_dispatch::models::{
    DeliveryStatus, HmacConfig, InboundRequest, RetryConfig, Source, SourceType, VerifierConfig,
};
use hookrelay_dispatch::retry::RetryStrategy;
use hookrelay_dispatch::services::NewSource;
use hookrelay_dispatch::CircuitState;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

const BODY: &[u8] = br#"{"id":"evt_100","type":"payment.succeeded","amount":1200}"#;

/// Retry policy for the scenarios: four attempts, exponential from 1s.
fn retry_policy() -> RetryConfig {
    RetryConfig {
        strategy: RetryStrategy::Exponential,
        duration_secs: 1,
        retry_count: 4,
    }
}

async fn signed_source(harness: &Harness) -> Source {
    harness
        .source_with(NewSource {
            name: "payments".to_string(),
            mask_id: None,
            source_type: SourceType::Http,
            verifier: VerifierConfig::Hmac(HmacConfig {
                header: "X-Payments-Signature".to_string(),
                secret: SOURCE_SECRET.to_string(),
                hash: HashAlgorithm::Sha256,
                encoding: SignatureEncoding::Hex,
                prefix: None,
            }),
            idempotency_keys: vec!["request.body.id".to_string()],
            custom_response: None,
            body_limit_bytes: None,
        })
        .await
}

fn signed_request() -> InboundRequest {
    InboundRequest::new(BODY.to_vec())
        .with_header("X-Payments-Signature", &sign_body(SOURCE_SECRET, BODY))
        .with_header("X-Event-Type", "payment.succeeded")
}

/// Three failures trip the breaker, so the fourth attempt is short-circuited
/// and the delivery fails terminally without the endpoint seeing it.
#[tokio::test]
async fn test_open_breaker_exhausts_retries_without_reaching_endpoint() {
    let server = MockServer::start().await;
    let responder = FailingResponder::fail_times(3);
    Mock::given(method("POST"))
        .and(path("/payments"))
        .respond_with(responder.clone())
        .mount(&server)
        .await;

    let harness = Harness::with_breaker(consecutive_breaker(3, 60)).await;
    let source = signed_source(&harness).await;
    let endpoint = harness
        .endpoint(&format!("{}/payments", server.uri()))
        .await;
    harness.subscribe(&source, &endpoint, retry_policy()).await;

    let event = harness.ingest(&source, signed_request()).await.unwrap().event;
    harness.settle(10).await;

    assert_eq!(responder.attempt_count(), 3);
    let delivery = harness.delivery_for(event.id).await;
    assert_eq!(delivery.status, DeliveryStatus::Failure);
    assert_eq!(delivery.attempts, 4);

    let attempts = harness.attempts(delivery.id).await;
    let synthetic: Vec<bool> = attempts.iter().map(|a| a.synthetic).collect();
    assert_eq!(synthetic, vec![false, false, false, true]);

    let status = harness
        .pipeline
        .operator
        .breaker_status(harness.project_id(), endpoint.id)
        .await
        .unwrap();
    assert_eq!(status.state, CircuitState::Open);
    assert_eq!(status.consecutive_failures, 3);

    // The producer retrying the same payment is rejected as a duplicate.
    let err = harness.ingest(&source, signed_request()).await.unwrap_err();
    assert!(matches!(
        err,
        hookrelay_dispatch::WebhookError::DuplicateEvent { existing_event_id }
            if existing_event_id == event.id
    ));
}

/// Same run, but the breaker's error timeout passes before the fourth
/// attempt: it goes out as the half-open trial request, succeeds and closes the
/// breaker.
#[tokio::test]
async fn test_trial_after_error_timeout_delivers_and_closes_breaker() {
    let server = MockServer::start().await;
    let responder = FailingResponder::fail_times(3);
    Mock::given(method("POST"))
        .and(path("/payments"))
        .respond_with(responder.clone())
        .mount(&server)
        .await;

    let harness = Harness::with_breaker(consecutive_breaker(3, 1)).await;
    let source = signed_source(&harness).await;
    let endpoint = harness
        .endpoint(&format!("{}/payments", server.uri()))
        .await;
    harness.subscribe(&source, &endpoint, retry_policy()).await;

    let event = harness.ingest(&source, signed_request()).await.unwrap().event;
    harness.drain().await;
    harness.drain_retries().await;
    harness.drain_retries().await;

    assert_eq!(responder.attempt_count(), 3);
    let status = harness
        .pipeline
        .operator
        .breaker_status(harness.project_id(), endpoint.id)
        .await
        .unwrap();
    assert_eq!(status.state, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    harness.drain_retries().await;

    assert_eq!(responder.attempt_count(), 4);
    let delivery = harness.delivery_for(event.id).await;
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempts, 4);
    assert!(harness
        .attempts(delivery.id)
        .await
        .iter()
        .all(|a| !a.synthetic));

    let status = harness
        .pipeline
        .operator
        .breaker_status(harness.project_id(), endpoint.id)
        .await
        .unwrap();
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.consecutive_failures, 0);
}

#[tokio::test]
async fn test_delivered_payload_is_byte_identical_and_signed() {
    let server = MockServer::start().await;
    let capture = CaptureResponder::new();
    Mock::given(method("POST"))
        .and(path("/payments"))
        .respond_with(capture.clone())
        .mount(&server)
        .await;

    let harness = Harness::new().await;
    let source = signed_source(&harness).await;
    let endpoint = harness
        .endpoint(&format!("{}/payments", server.uri()))
        .await;
    harness.subscribe(&source, &endpoint, retry_policy()).await;

    harness.ingest(&source, signed_request()).await.unwrap();
    harness.drain().await;

    let requests = capture.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, BODY);
    assert_eq!(
        requests[0].header("x-hookrelay-event-type"),
        Some("payment.succeeded")
    );
    assert!(verify_signature_header(
        requests[0].header("x-hookrelay-signature").unwrap(),
        SECRET_1,
        BODY,
        HashAlgorithm::Sha256,
        SignatureEncoding::Hex,
    ));
}
