use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{HashAlgorithm, SignatureEncoding};

/// Transport a source receives events over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    Http,
    RestApi,
    PubSub,
    DbChangeStream,
}

impl SourceType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::RestApi => "rest_api",
            Self::PubSub => "pub_sub",
            Self::DbChangeStream => "db_change_stream",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Self::Http),
            "rest_api" => Some(Self::RestApi),
            "pub_sub" => Some(Self::PubSub),
            "db_change_stream" => Some(Self::DbChangeStream),
            _ => None,
        }
    }
}

/// Generic HMAC verification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HmacConfig {
    pub header: String,
    pub secret: String,
    #[serde(default)]
    pub hash: HashAlgorithm,
    #[serde(default)]
    pub encoding: SignatureEncoding,
    /// Literal prefix in front of the encoded signature, e.g. `sha256=`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// How inbound requests to a source are authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerifierConfig {
    #[default]
    Noop,
    Hmac(HmacConfig),
    BasicAuth {
        username: String,
        password: String,
    },
    ApiKey {
        header: String,
        key: String,
    },
    /// Vendor scheme by name (`github`, `shopify`, `twitter`).
    Provider {
        name: String,
        secret: String,
    },
}

/// Fixed response body returned to the producer on successful ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomResponse {
    pub body: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Public identifier used in ingestion URLs.
    pub mask_id: String,
    pub name: String,
    pub source_type: SourceType,
    pub verifier: VerifierConfig,
    /// Locators of the request fields forming the idempotency key.
    #[serde(default)]
    pub idempotency_keys: Vec<String>,
    #[serde(default)]
    pub custom_response: Option<CustomResponse>,
    /// Overrides the global payload limit when set.
    #[serde(default)]
    pub body_limit_bytes: Option<usize>,
    pub created_at: DateTime<Utc>,
}
