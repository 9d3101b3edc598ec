use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

use crate::retry::RetryStrategy;

/// Event-type allow-list plus structured predicates over headers and body.
///
/// `Value::Null` and `{}` predicates match everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub headers: Value,
    #[serde(default)]
    pub body: Value,
}

impl SubscriptionFilter {
    #[must_use]
    pub fn with_event_types(mut self, types: &[&str]) -> Self {
        self.event_types = types.iter().map(|t| (*t).to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_headers(mut self, predicate: Value) -> Self {
        self.headers = predicate;
        self
    }

    #[must_use]
    pub fn with_body(mut self, predicate: Value) -> Self {
        self.body = predicate;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RetryConfig {
    pub strategy: RetryStrategy,
    /// Base interval in seconds.
    #[validate(range(min = 1, message = "must be greater than 0"))]
    pub duration_secs: u64,
    /// Total attempts allowed before the delivery fails terminally.
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub retry_count: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            duration_secs: 10,
            retry_count: 3,
        }
    }
}

/// Failure notification thresholds. Not consulted by the dispatch path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertConfig {
    pub count: u32,
    pub threshold_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            count: 10,
            threshold_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    /// `None` subscribes to events from every source of the project.
    pub source_id: Option<Uuid>,
    pub endpoint_id: Uuid,
    #[serde(default)]
    pub filter: SubscriptionFilter,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    pub created_at: DateTime<Utc>,
}
