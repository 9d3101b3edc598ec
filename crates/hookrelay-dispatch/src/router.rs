//! Axum router setup for the ingest and operator endpoints.

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};

use crate::handlers::{catalog, circuit_breakers, deliveries, events, ingest};
use crate::services::{CatalogService, IngestService, OperatorService};

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestService>,
    pub operator: Arc<OperatorService>,
    pub catalog: Arc<CatalogService>,
    /// Hard cap on inbound request bodies.
    pub max_body_bytes: usize,
}

/// Creates the router with all routes.
pub fn api_router(state: AppState) -> Router {
    let ingest_routes = Router::new()
        .route("/ingest/:mask_id", post(ingest::ingest_handler))
        .layer(DefaultBodyLimit::max(state.max_body_bytes));

    Router::new()
        .route("/health", get(health_handler))
        // Catalog
        .route("/projects", post(catalog::create_project_handler))
        .route(
            "/projects/:project_id/sources",
            post(catalog::create_source_handler),
        )
        .route(
            "/projects/:project_id/endpoints",
            post(catalog::create_endpoint_handler),
        )
        .route(
            "/projects/:project_id/endpoints/:endpoint_id",
            axum::routing::delete(catalog::delete_endpoint_handler),
        )
        .route(
            "/projects/:project_id/endpoints/:endpoint_id/pause",
            post(catalog::pause_endpoint_handler),
        )
        .route(
            "/projects/:project_id/endpoints/:endpoint_id/activate",
            post(catalog::activate_endpoint_handler),
        )
        .route(
            "/projects/:project_id/endpoints/:endpoint_id/rotate-secret",
            post(catalog::rotate_endpoint_secret_handler),
        )
        .route(
            "/projects/:project_id/subscriptions",
            post(catalog::create_subscription_handler),
        )
        .route(
            "/projects/:project_id/subscriptions/:subscription_id",
            axum::routing::delete(catalog::delete_subscription_handler),
        )
        // Deliveries
        .route(
            "/projects/:project_id/deliveries",
            get(deliveries::list_deliveries_handler),
        )
        .route(
            "/projects/:project_id/deliveries/batch-retry",
            post(deliveries::batch_retry_handler),
        )
        .route(
            "/projects/:project_id/deliveries/force-resend",
            post(deliveries::force_resend_handler),
        )
        .route(
            "/projects/:project_id/deliveries/:delivery_id",
            get(deliveries::get_delivery_handler),
        )
        .route(
            "/projects/:project_id/deliveries/:delivery_id/attempts",
            get(deliveries::list_attempts_handler),
        )
        .route(
            "/projects/:project_id/deliveries/:delivery_id/resend",
            post(deliveries::resend_delivery_handler),
        )
        // Events
        .route(
            "/projects/:project_id/events/:event_id/replay",
            post(events::replay_event_handler),
        )
        // Circuit breakers
        .route(
            "/projects/:project_id/circuit-breakers",
            get(circuit_breakers::list_circuit_breakers_handler),
        )
        .route(
            "/projects/:project_id/circuit-breakers/config",
            put(circuit_breakers::update_circuit_breaker_config_handler),
        )
        .route(
            "/projects/:project_id/circuit-breakers/reset",
            post(circuit_breakers::reset_circuit_breakers_handler),
        )
        .route(
            "/projects/:project_id/circuit-breakers/:endpoint_id",
            get(circuit_breakers::get_circuit_breaker_handler),
        )
        .merge(ingest_routes)
        .with_state(state)
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
