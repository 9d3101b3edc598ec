//! HTTP handlers for circuit breaker status and administration.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerStatus};
use crate::error::ApiResult;
use crate::router::AppState;
use crate::services::BreakerConfigUpdate;

/// Response containing a list of circuit breaker statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerListResponse {
    pub circuit_breakers: Vec<CircuitBreakerStatus>,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResetRequest {
    /// Empty resets every endpoint of the project.
    #[serde(default)]
    pub endpoint_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetResponse {
    pub reset: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// Circuit Breaker Status Handlers
// ---------------------------------------------------------------------------

/// List the breaker of every endpoint in the project.
pub async fn list_circuit_breakers_handler(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<CircuitBreakerListResponse>> {
    let statuses = state.operator.list_breakers(project_id).await?;
    let total = statuses.len();
    Ok(Json(CircuitBreakerListResponse {
        circuit_breakers: statuses,
        total,
    }))
}

/// Breaker status of one endpoint. Endpoints without recorded traffic report
/// closed.
pub async fn get_circuit_breaker_handler(
    State(state): State<AppState>,
    Path((project_id, endpoint_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<CircuitBreakerStatus>> {
    Ok(Json(
        state
            .operator
            .breaker_status(project_id, endpoint_id)
            .await?,
    ))
}

// ---------------------------------------------------------------------------
// Circuit Breaker Administration Handlers
// ---------------------------------------------------------------------------

pub async fn reset_circuit_breakers_handler(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<ResetRequest>,
) -> ApiResult<Json<ResetResponse>> {
    let reset = state
        .operator
        .reset_breakers(project_id, &request.endpoint_ids)
        .await?;
    Ok(Json(ResetResponse { reset }))
}

pub async fn update_circuit_breaker_config_handler(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(update): Json<BreakerConfigUpdate>,
) -> ApiResult<Json<CircuitBreakerConfig>> {
    Ok(Json(
        state
            .operator
            .update_breaker_config(project_id, &update)
            .await?,
    ))
}
