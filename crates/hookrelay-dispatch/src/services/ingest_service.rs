//! Event ingestion.
//!
//! Resolves a source by its mask id, checks size and authenticity, rejects
//! duplicates and persists the event before handing it to the event
//! processing queue. Matching and dispatch never run on the caller's request.

use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;
use uuid::Uuid;

use crate::dedup::{checksum, resolve_key_fields, Deduplicator};
use crate::error::WebhookError;
use crate::models::{
    CustomResponse, Event, EventStatus, InboundRequest, SourceType, EVENT_TYPE_HEADER,
    WILDCARD_EVENT_TYPE,
};
use crate::queue::{Job, JobQueue};
use crate::store::Store;
use crate::verifier::Verifier;

/// Result of a successful ingestion.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub event: Event,
    /// Body the caller should answer with, when the source configures one.
    pub response: Option<CustomResponse>,
}

pub struct IngestService {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    dedup: Deduplicator,
    max_payload_bytes: usize,
}

impl IngestService {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        dedup: Deduplicator,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            store,
            queue,
            dedup,
            max_payload_bytes,
        }
    }

    /// Accept one submission for the source behind `mask_id`.
    #[instrument(skip(self, request), fields(body_len = request.body.len()))]
    pub async fn ingest(
        &self,
        mask_id: &str,
        request: InboundRequest,
    ) -> Result<IngestOutcome, WebhookError> {
        let source = self
            .store
            .get_source_by_mask(mask_id)
            .await?
            .ok_or(WebhookError::SourceNotFound)?;

        if source.source_type != SourceType::Http {
            return Err(WebhookError::UnsupportedSourceType(
                source.source_type.as_str().to_string(),
            ));
        }

        // Per-source limits can only tighten the process-wide one.
        let limit = source
            .body_limit_bytes
            .map_or(self.max_payload_bytes, |l| l.min(self.max_payload_bytes));
        if request.body.len() > limit {
            return Err(WebhookError::PayloadTooLarge {
                size: request.body.len(),
                limit,
            });
        }

        let verifier = Verifier::from_config(&source.verifier)?;
        if let Err(e) = verifier.verify(&request) {
            tracing::warn!(
                target: "ingest",
                source_id = %source.id,
                project_id = %source.project_id,
                error = %e,
                "Inbound request failed verification"
            );
            return Err(e.into());
        }

        let key_fields = resolve_key_fields(&source.idempotency_keys, &request);
        if let Some(existing_event_id) = self
            .dedup
            .find_duplicate(&source.name, source.project_id, &key_fields)
            .await?
        {
            tracing::info!(
                target: "ingest",
                source_id = %source.id,
                existing_event_id = %existing_event_id,
                "Rejected duplicate event"
            );
            return Err(WebhookError::DuplicateEvent { existing_event_id });
        }

        let event_type = request
            .header(EVENT_TYPE_HEADER)
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(WILDCARD_EVENT_TYPE)
            .to_string();
        let idempotency_key =
            (!key_fields.is_empty()).then(|| checksum(&source.name, &key_fields));

        let event = Event {
            id: Uuid::new_v4(),
            project_id: source.project_id,
            source_id: Some(source.id),
            event_type,
            headers: request.headers,
            payload: request.body,
            idempotency_key,
            endpoint_ids: Vec::new(),
            status: EventStatus::Pending,
            created_at: Utc::now(),
        };
        self.store.insert_event(&event).await?;

        // A failed enqueue leaves the event pending; replay picks it up.
        self.queue
            .enqueue(
                Job::CreateEvent {
                    event_id: event.id,
                    project_id: event.project_id,
                },
                None,
            )
            .await?;

        tracing::info!(
            target: "ingest",
            event_id = %event.id,
            source_id = %source.id,
            project_id = %event.project_id,
            event_type = %event.event_type,
            "Event ingested"
        );

        Ok(IngestOutcome {
            event,
            response: source.custom_response,
        })
    }
}
