//! Best-effort duplicate detection for inbound events.
//!
//! A source lists the request fields that identify a logical event. Their
//! values are hashed into an idempotency key, and a new submission is rejected
//! when an event with the same key exists for the project within the lookback
//! window. The check and the later insert are not atomic, so two concurrent
//! duplicates can both pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use crate::crypto::sha256_hex;
use crate::error::WebhookError;
use crate::models::InboundRequest;
use crate::store::Store;

/// Header a producer may set to supply its own idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

/// Where a key field is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyLocator {
    Header(String),
    Body(Vec<String>),
    QueryParam(String),
}

impl KeyLocator {
    /// Parse `request.header.<name>`, `request.body.<dot.path>` or
    /// `request.query_param.<name>`.
    #[must_use]
    pub fn parse(locator: &str) -> Option<Self> {
        let rest = locator.strip_prefix("request.")?;
        if let Some(name) = rest.strip_prefix("header.") {
            (!name.is_empty()).then(|| Self::Header(name.to_ascii_lowercase()))
        } else if let Some(path) = rest.strip_prefix("body.") {
            let segments: Vec<String> = path.split('.').map(str::to_string).collect();
            (!segments.iter().any(String::is_empty)).then_some(Self::Body(segments))
        } else if let Some(name) = rest.strip_prefix("query_param.") {
            (!name.is_empty()).then(|| Self::QueryParam(name.to_string()))
        } else {
            None
        }
    }

    fn resolve(&self, request: &InboundRequest, body: Option<&Value>) -> Option<String> {
        match self {
            Self::Header(name) => request.header(name).map(str::to_string),
            Self::QueryParam(name) => request.query.get(name).cloned(),
            Self::Body(path) => {
                let mut current = body?;
                for segment in path {
                    current = match current {
                        Value::Object(map) => map.get(segment)?,
                        Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                        _ => return None,
                    };
                }
                Some(match current {
                    Value::String(s) => s.clone(),
                    // Object keys serialize sorted, so formatting does not leak in.
                    other => other.to_string(),
                })
            }
        }
    }
}

/// Resolve the configured key fields of a request.
///
/// Unparsable locators and fields absent from the request are skipped. A
/// caller-supplied [`IDEMPOTENCY_HEADER`] is always included.
#[must_use]
pub fn resolve_key_fields(locators: &[String], request: &InboundRequest) -> BTreeMap<String, String> {
    let body: Option<Value> = serde_json::from_slice(&request.body).ok();
    let mut fields = BTreeMap::new();

    for raw in locators {
        let Some(locator) = KeyLocator::parse(raw) else {
            continue;
        };
        if let Some(value) = locator.resolve(request, body.as_ref()) {
            fields.insert(raw.clone(), value);
        }
    }

    if let Some(key) = request.header(IDEMPOTENCY_HEADER) {
        fields.insert(format!("request.header.{IDEMPOTENCY_HEADER}"), key.to_string());
    }

    fields
}

/// Deterministic key over the source name and the resolved fields.
#[must_use]
pub fn checksum(source_name: &str, key_fields: &BTreeMap<String, String>) -> String {
    let mut material = String::from(source_name);
    for (field, value) in key_fields {
        material.push('\n');
        material.push_str(field);
        material.push('=');
        material.push_str(value);
    }
    sha256_hex(material.as_bytes())
}

pub struct Deduplicator {
    store: Arc<dyn Store>,
    window: Duration,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn Store>, window: Duration) -> Self {
        Self { store, window }
    }

    /// Id of an event in the window carrying the same idempotency key.
    #[instrument(skip(self, key_fields))]
    pub async fn find_duplicate(
        &self,
        source_name: &str,
        project_id: Uuid,
        key_fields: &BTreeMap<String, String>,
    ) -> Result<Option<Uuid>, WebhookError> {
        if key_fields.is_empty() {
            return Ok(None);
        }
        let key = checksum(source_name, key_fields);
        let since = Utc::now()
            - chrono::Duration::from_std(self.window)
                .map_err(|e| WebhookError::Configuration(format!("dedup window: {e}")))?;
        let existing = self
            .store
            .find_event_by_idempotency_key(project_id, &key, since)
            .await?;
        Ok(existing.map(|event| event.id))
    }

    pub async fn exists(
        &self,
        source_name: &str,
        project_id: Uuid,
        key_fields: &BTreeMap<String, String>,
    ) -> Result<bool, WebhookError> {
        Ok(self
            .find_duplicate(source_name, project_id, key_fields)
            .await?
            .is_some())
    }
}
