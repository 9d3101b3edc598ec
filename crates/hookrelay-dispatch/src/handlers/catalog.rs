//! Registration of projects, sources, endpoints and subscriptions.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ApiResult;
use crate::models::{Endpoint, EndpointSecret, Project, SignatureConfig, Source, Subscription};
use crate::router::AppState;
use crate::services::{NewEndpoint, NewSource, NewSubscription};

/// Default overlap during which a rotated secret still signs.
const DEFAULT_ROTATION_GRACE_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub breaker: Option<CircuitBreakerConfig>,
    #[serde(default)]
    pub signature: Option<SignatureConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RotateSecretRequest {
    /// Seconds the previous secrets remain valid.
    pub grace_secs: Option<i64>,
}

// ---------------------------------------------------------------------------
// Projects and Sources
// ---------------------------------------------------------------------------

pub async fn create_project_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let mut project = Project::new(request.name);
    if let Some(breaker) = request.breaker {
        project = project.with_breaker(breaker);
    }
    if let Some(signature) = request.signature {
        project = project.with_signature(signature);
    }
    let project = state.catalog.create_project(project).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn create_source_handler(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<NewSource>,
) -> ApiResult<(StatusCode, Json<Source>)> {
    let source = state.catalog.create_source(project_id, request).await?;
    Ok((StatusCode::CREATED, Json(source)))
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

pub async fn create_endpoint_handler(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<NewEndpoint>,
) -> ApiResult<(StatusCode, Json<Endpoint>)> {
    let endpoint = state.catalog.create_endpoint(project_id, request).await?;
    Ok((StatusCode::CREATED, Json(endpoint)))
}

pub async fn pause_endpoint_handler(
    State(state): State<AppState>,
    Path((project_id, endpoint_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.catalog.pause_endpoint(project_id, endpoint_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn activate_endpoint_handler(
    State(state): State<AppState>,
    Path((project_id, endpoint_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state
        .catalog
        .activate_endpoint(project_id, endpoint_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn rotate_endpoint_secret_handler(
    State(state): State<AppState>,
    Path((project_id, endpoint_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<RotateSecretRequest>,
) -> ApiResult<Json<EndpointSecret>> {
    let grace = chrono::Duration::seconds(
        request
            .grace_secs
            .unwrap_or(DEFAULT_ROTATION_GRACE_SECS)
            .max(0),
    );
    let secret = state
        .catalog
        .rotate_endpoint_secret(project_id, endpoint_id, grace)
        .await?;
    Ok(Json(secret))
}

pub async fn delete_endpoint_handler(
    State(state): State<AppState>,
    Path((project_id, endpoint_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.catalog.delete_endpoint(project_id, endpoint_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

pub async fn create_subscription_handler(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<NewSubscription>,
) -> ApiResult<(StatusCode, Json<Subscription>)> {
    let subscription = state
        .catalog
        .create_subscription(project_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn delete_subscription_handler(
    State(state): State<AppState>,
    Path((project_id, subscription_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state
        .catalog
        .delete_subscription(project_id, subscription_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
