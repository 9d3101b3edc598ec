//! HTTP surface tests driven through the axum router with `oneshot`.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::*;
use hookrelay_dispatch::{DispatchConfig, Pipeline};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

async fn send(router: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };
    let response = router.oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn id(value: &Value) -> String {
    value["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let pipeline = Pipeline::in_memory(test_config()).unwrap();
    let (status, body) = send(pipeline.router(), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_register_ingest_and_inspect_over_http() {
    let server = MockServer::start().await;
    let capture = CaptureResponder::new();
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(capture.clone())
        .mount(&server)
        .await;

    let pipeline = Pipeline::in_memory(test_config()).unwrap();

    let (status, project) = send(
        pipeline.router(),
        Method::POST,
        "/projects",
        Some(json!({"name": "acme"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let project_id = id(&project);

    let (status, source) = send(
        pipeline.router(),
        Method::POST,
        &format!("/projects/{project_id}/sources"),
        Some(json!({"name": "orders"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let mask_id = source["mask_id"].as_str().unwrap().to_string();

    let (status, endpoint) = send(
        pipeline.router(),
        Method::POST,
        &format!("/projects/{project_id}/endpoints"),
        Some(json!({"name": "receiver", "url": format!("{}/hook", server.uri())})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let endpoint_id = id(&endpoint);

    let (status, _) = send(
        pipeline.router(),
        Method::POST,
        &format!("/projects/{project_id}/subscriptions"),
        Some(json!({
            "name": "orders-to-receiver",
            "source_id": id(&source),
            "endpoint_id": endpoint_id,
            "filter": {"event_types": ["order.created"]}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let response = pipeline
        .router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(format!("/ingest/{mask_id}"))
                .header("X-Event-Type", "order.created")
                .body(Body::from(r#"{"order":7}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let accepted: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
            .unwrap();
    assert_eq!(accepted["event_type"], "order.created");

    pipeline.run_pending().await.unwrap();
    assert_eq!(capture.request_count(), 1);

    let (status, list) = send(
        pipeline.router(),
        Method::GET,
        &format!("/projects/{project_id}/deliveries?status=success"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);
    let delivery_id = list["items"][0]["id"].as_str().unwrap().to_string();
    assert_eq!(list["items"][0]["event_id"], accepted["event_id"]);

    let (status, attempts) = send(
        pipeline.router(),
        Method::GET,
        &format!("/projects/{project_id}/deliveries/{delivery_id}/attempts"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(attempts["total"], 1);

    let (status, body) = send(
        pipeline.router(),
        Method::POST,
        &format!("/projects/{project_id}/deliveries/{delivery_id}/resend"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_delivered");

    let (status, breakers) = send(
        pipeline.router(),
        Method::GET,
        &format!("/projects/{project_id}/circuit-breakers/{endpoint_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(breakers["state"], "closed");
}

#[tokio::test]
async fn test_unknown_mask_id_returns_404() {
    let pipeline = Pipeline::in_memory(test_config()).unwrap();
    let response = pipeline
        .router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/ingest/nope")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
            .unwrap();
    assert_eq!(body["error"], "source_not_found");
}

#[tokio::test]
async fn test_custom_response_sets_content_type() {
    let harness = Harness::new().await;
    let source = harness
        .source_with(hookrelay_dispatch::services::NewSource {
            name: "custom".to_string(),
            mask_id: Some("custom1".to_string()),
            source_type: Default::default(),
            verifier: Default::default(),
            idempotency_keys: Vec::new(),
            custom_response: Some(hookrelay_dispatch::models::CustomResponse {
                body: "<ok/>".to_string(),
                content_type: "application/xml".to_string(),
            }),
            body_limit_bytes: None,
        })
        .await;

    let response = harness
        .pipeline
        .router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(format!("/ingest/{}", source.mask_id))
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/xml"
    );
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"<ok/>");
}

#[tokio::test]
async fn test_source_with_unusable_content_type_is_rejected_before_ingest() {
    let harness = Harness::new().await;
    let (status, body) = send(
        harness.pipeline.router(),
        Method::POST,
        &format!("/projects/{}/sources", harness.project_id()),
        Some(json!({
            "name": "custom",
            "custom_response": {"body": "ok", "content_type": "text/plain\nX-Injected: 1"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert_eq!(body["fields"][0]["field"], "custom_response.content_type");
}

#[tokio::test]
async fn test_body_over_process_limit_is_rejected() {
    let pipeline = Pipeline::in_memory(DispatchConfig {
        max_payload_bytes: 16,
        ..test_config()
    })
    .unwrap();
    let response = pipeline
        .router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/ingest/anything")
                .body(Body::from("x".repeat(64)))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_invalid_status_filter_is_a_field_error() {
    let harness = Harness::new().await;
    let (status, body) = send(
        harness.pipeline.router(),
        Method::GET,
        &format!("/projects/{}/deliveries?status=success,bogus", harness.project_id()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert_eq!(body["fields"][0]["field"], "status");
}

#[tokio::test]
async fn test_breaker_config_update_validates_fields() {
    let harness = Harness::new().await;
    let uri = format!("/projects/{}/circuit-breakers/config", harness.project_id());

    let (status, body) = send(
        harness.pipeline.router(),
        Method::PUT,
        &uri,
        Some(json!({"failure_threshold": 101, "observability_window": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let fields: Vec<&str> = body["fields"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"failure_threshold"));
    assert!(fields.contains(&"observability_window"));

    let (status, body) = send(
        harness.pipeline.router(),
        Method::PUT,
        &uri,
        Some(json!({"failure_threshold": 50})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["failure_threshold"], 50);
}
