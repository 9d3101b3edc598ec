//! Event replay.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::models::EventDelivery;
use crate::router::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct ReplayResponse {
    pub event_id: Uuid,
    pub deliveries: Vec<EventDelivery>,
}

/// Re-run subscription matching for a pending event.
pub async fn replay_event_handler(
    State(state): State<AppState>,
    Path((project_id, event_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<ReplayResponse>> {
    let deliveries = state.operator.replay_event(project_id, event_id).await?;
    Ok(Json(ReplayResponse {
        event_id,
        deliveries,
    }))
}
