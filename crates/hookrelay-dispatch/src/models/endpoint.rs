use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    #[default]
    Active,
    /// Dispatch suspended by the tenant; deliveries are kept.
    Paused,
    Inactive,
}

impl EndpointStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Inactive => "inactive",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// A signing secret. Secrets overlap during rotation until the old one expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSecret {
    pub value: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EndpointSecret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires| expires > now)
    }
}

/// OAuth2 client authentication method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum OAuth2Grant {
    ClientSecret {
        client_secret: String,
    },
    /// HS256-signed JWT bearer assertion.
    ClientAssertion {
        signing_key: String,
        #[serde(default)]
        issuer: Option<String>,
        #[serde(default = "default_assertion_expiry")]
        expiry_secs: u64,
    },
}

fn default_assertion_expiry() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Config {
    pub token_url: String,
    pub client_id: String,
    pub grant: OAuth2Grant,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
}

/// Extra authentication attached to every outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointAuth {
    ApiKey {
        header_name: String,
        header_value: String,
    },
    #[serde(rename = "oauth2")]
    OAuth2(OAuth2Config),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub secrets: Vec<EndpointSecret>,
    pub status: EndpointStatus,
    #[serde(default)]
    pub auth: Option<EndpointAuth>,
    /// Overrides the global HTTP timeout when set.
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Endpoint {
    /// Secret values that have not expired at `now`, oldest first.
    #[must_use]
    pub fn active_secrets(&self, now: DateTime<Utc>) -> Vec<&str> {
        self.secrets
            .iter()
            .filter(|s| s.is_active(now))
            .map(|s| s.value.as_str())
            .collect()
    }
}
