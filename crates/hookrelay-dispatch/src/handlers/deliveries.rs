//! HTTP handlers for delivery history and operator retries.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiResult, FieldErrors};
use crate::models::{DeliveryAttempt, DeliveryFilter, DeliveryStatus, EventDelivery};
use crate::router::AppState;
use crate::services::BatchReport;

/// Query parameters for listing deliveries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListDeliveriesQuery {
    pub endpoint_id: Option<Uuid>,
    pub event_id: Option<Uuid>,
    /// Comma separated, e.g. `failure,discarded`.
    pub status: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl ListDeliveriesQuery {
    fn into_filter(self) -> Result<DeliveryFilter, crate::error::WebhookError> {
        let mut errors = FieldErrors::default();
        let mut status = Vec::new();
        for raw in self.status.iter().flat_map(|s| s.split(',')) {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match DeliveryStatus::parse(raw) {
                Some(s) => status.push(s),
                None => errors.push("status", format!("unknown delivery status '{raw}'")),
            }
        }
        errors.into_result()?;

        Ok(DeliveryFilter {
            endpoint_id: self.endpoint_id,
            event_id: self.event_id,
            status,
            created_after: self.created_after,
            created_before: self.created_before,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryListResponse {
    pub items: Vec<EventDelivery>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptListResponse {
    pub items: Vec<DeliveryAttempt>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub message: String,
    pub successful: u64,
    pub failed: u64,
    pub already_delivered: u64,
}

impl From<BatchReport> for BatchResponse {
    fn from(report: BatchReport) -> Self {
        Self {
            message: report.message(),
            successful: report.successful,
            failed: report.failed,
            already_delivered: report.already_delivered,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForceResendRequest {
    pub ids: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// Delivery History Handlers
// ---------------------------------------------------------------------------

pub async fn list_deliveries_handler(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<ListDeliveriesQuery>,
) -> ApiResult<Json<DeliveryListResponse>> {
    let filter = query.into_filter()?;
    let items = state.operator.list_deliveries(project_id, &filter).await?;
    let total = items.len();
    Ok(Json(DeliveryListResponse { items, total }))
}

pub async fn get_delivery_handler(
    State(state): State<AppState>,
    Path((project_id, delivery_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<EventDelivery>> {
    Ok(Json(
        state.operator.get_delivery(project_id, delivery_id).await?,
    ))
}

pub async fn list_attempts_handler(
    State(state): State<AppState>,
    Path((project_id, delivery_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<AttemptListResponse>> {
    let items = state.operator.list_attempts(project_id, delivery_id).await?;
    let total = items.len();
    Ok(Json(AttemptListResponse { items, total }))
}

// ---------------------------------------------------------------------------
// Retry Handlers
// ---------------------------------------------------------------------------

/// Resend one failed or discarded delivery.
pub async fn resend_delivery_handler(
    State(state): State<AppState>,
    Path((project_id, delivery_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<EventDelivery>> {
    Ok(Json(state.operator.resend(project_id, delivery_id).await?))
}

/// Resend every delivery matching the filter in the body.
pub async fn batch_retry_handler(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(filter): Json<DeliveryFilter>,
) -> ApiResult<Json<BatchResponse>> {
    let report = state.operator.batch_retry(project_id, filter).await?;
    Ok(Json(report.into()))
}

/// Resend the listed deliveries, bypassing the circuit breaker.
pub async fn force_resend_handler(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<ForceResendRequest>,
) -> ApiResult<Json<BatchResponse>> {
    let report = state
        .operator
        .force_resend(project_id, &request.ids)
        .await?;
    Ok(Json(report.into()))
}
