use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::RetryStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Scheduled,
    Processing,
    Success,
    Failure,
    Discarded,
}

impl DeliveryStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Discarded => "discarded",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "processing" => Some(Self::Processing),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "discarded" => Some(Self::Discarded),
            _ => None,
        }
    }

    /// No further automatic attempts happen from a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Discarded)
    }
}

/// Retry policy snapshot taken from the subscription when the delivery is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    pub strategy: RetryStrategy,
    pub interval_secs: u64,
    pub retry_limit: u32,
}

/// One planned push of one event to one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDelivery {
    pub id: Uuid,
    pub project_id: Uuid,
    pub event_id: Uuid,
    pub endpoint_id: Uuid,
    pub subscription_id: Uuid,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub metadata: DeliveryMetadata,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Audit record of one push (or one short-circuited push). Never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub delivery_id: Uuid,
    pub project_id: Uuid,
    pub endpoint_id: Uuid,
    pub attempt_number: u32,
    pub request_headers: BTreeMap<String, String>,
    pub request_body: String,
    pub response_status: Option<u16>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<String>,
    /// Transport-level error, or the reason no request was sent.
    pub error: Option<String>,
    /// True when no HTTP request was issued.
    pub synthetic: bool,
    pub latency_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.synthetic
            && self.error.is_none()
            && self
                .response_status
                .is_some_and(|status| (200..300).contains(&status))
    }
}

/// Selection criteria for delivery listing and batch retry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFilter {
    #[serde(default)]
    pub endpoint_id: Option<Uuid>,
    #[serde(default)]
    pub event_id: Option<Uuid>,
    /// Empty matches every status.
    #[serde(default)]
    pub status: Vec<DeliveryStatus>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
}

impl DeliveryFilter {
    #[must_use]
    pub fn with_endpoint(mut self, endpoint_id: Uuid) -> Self {
        self.endpoint_id = Some(endpoint_id);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: DeliveryStatus) -> Self {
        self.status.push(status);
        self
    }

    #[must_use]
    pub fn matches(&self, delivery: &EventDelivery) -> bool {
        self.endpoint_id.map_or(true, |id| delivery.endpoint_id == id)
            && self.event_id.map_or(true, |id| delivery.event_id == id)
            && (self.status.is_empty() || self.status.contains(&delivery.status))
            && self
                .created_after
                .map_or(true, |after| delivery.created_at >= after)
            && self
                .created_before
                .map_or(true, |before| delivery.created_at < before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(status: DeliveryStatus) -> EventDelivery {
        let now = Utc::now();
        EventDelivery {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            endpoint_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            status,
            attempts: 0,
            next_attempt_at: None,
            metadata: DeliveryMetadata {
                strategy: RetryStrategy::Linear,
                interval_secs: 10,
                retry_limit: 3,
            },
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_filter_matches_status_and_endpoint() {
        let d = delivery(DeliveryStatus::Failure);
        assert!(DeliveryFilter::default().matches(&d));
        assert!(DeliveryFilter::default()
            .with_status(DeliveryStatus::Failure)
            .matches(&d));
        assert!(!DeliveryFilter::default()
            .with_status(DeliveryStatus::Success)
            .matches(&d));
        assert!(!DeliveryFilter::default()
            .with_endpoint(Uuid::new_v4())
            .matches(&d));
    }

    #[test]
    fn test_filter_time_range() {
        let d = delivery(DeliveryStatus::Scheduled);
        let filter = DeliveryFilter {
            created_after: Some(d.created_at + chrono::Duration::seconds(1)),
            ..DeliveryFilter::default()
        };
        assert!(!filter.matches(&d));
    }

    #[test]
    fn test_terminal_states() {
        assert!(DeliveryStatus::Failure.is_terminal());
        assert!(!DeliveryStatus::Scheduled.is_terminal());
        assert!(!DeliveryStatus::Processing.is_terminal());
    }
}
