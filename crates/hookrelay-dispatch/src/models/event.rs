use std::collections::BTreeMap;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the producer's event type.
pub const EVENT_TYPE_HEADER: &str = "x-event-type";

/// Event type assigned when the producer sends none.
pub const WILDCARD_EVENT_TYPE: &str = "*";

/// Whether matching against subscriptions has completed for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Ingested, matching not yet done.
    #[default]
    Pending,
    /// At least one endpoint matched.
    Processed,
    /// No endpoint matched.
    Failure,
}

impl EventStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failure => "failure",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processed" => Some(Self::Processed),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

/// An ingested event. Only `endpoint_ids` and `status` change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub project_id: Uuid,
    pub source_id: Option<Uuid>,
    pub event_type: String,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
    pub idempotency_key: Option<String>,
    pub endpoint_ids: Vec<Uuid>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Payload parsed as JSON, `None` for non-JSON bodies.
    #[must_use]
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Raw request handed to ingestion by the HTTP front door.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundRequest {
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl InboundRequest {
    #[must_use]
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }

    /// Build from an HTTP header map. Non-UTF-8 header values are dropped.
    #[must_use]
    pub fn from_parts(headers: &HeaderMap, query: BTreeMap<String, String>, body: Vec<u8>) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        Self {
            headers,
            query,
            body,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = InboundRequest::new(Vec::new()).with_header("X-Event-Type", "order.created");
        assert_eq!(request.header("x-event-type"), Some("order.created"));
        assert_eq!(request.header("X-EVENT-TYPE"), Some("order.created"));
    }

    #[test]
    fn test_from_parts_lowercases_names() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Idempotency-Key", "abc".parse().unwrap());
        let request = InboundRequest::from_parts(&headers, BTreeMap::new(), Vec::new());
        assert_eq!(request.headers.get("x-idempotency-key").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [EventStatus::Pending, EventStatus::Processed, EventStatus::Failure] {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
    }
}
