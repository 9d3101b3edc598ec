//! Inbound webhook front door.

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::models::InboundRequest;
use crate::router::AppState;

const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Default acknowledgement when the source has no custom response.
#[derive(Debug, Clone, Serialize)]
pub struct IngestAccepted {
    pub event_id: Uuid,
    pub event_type: String,
}

/// Accept a webhook for the source behind `mask_id`.
pub async fn ingest_handler(
    State(state): State<AppState>,
    Path(mask_id): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let request = InboundRequest::from_parts(&headers, query, body.to_vec());
    let outcome = state.ingest.ingest(&mask_id, request).await?;

    let response = match outcome.response {
        Some(custom) => {
            // The event is already persisted; a stored content type that no longer
            // parses must not turn the acknowledgement into an error.
            let content_type = HeaderValue::from_str(&custom.content_type).unwrap_or_else(|_| {
                tracing::warn!(
                    content_type = %custom.content_type,
                    "Ignoring invalid custom response content type"
                );
                HeaderValue::from_static(DEFAULT_CONTENT_TYPE)
            });
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], custom.body).into_response()
        }
        None => (
            StatusCode::OK,
            Json(IngestAccepted {
                event_id: outcome.event.id,
                event_type: outcome.event.event_type,
            }),
        )
            .into_response(),
    };
    Ok(response)
}
