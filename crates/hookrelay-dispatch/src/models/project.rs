use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::crypto::{HashAlgorithm, SignatureEncoding};

/// How outbound payloads are signed for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureConfig {
    pub header: String,
    #[serde(default)]
    pub hash: HashAlgorithm,
    #[serde(default)]
    pub encoding: SignatureEncoding,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            header: "X-Hookrelay-Signature".to_string(),
            hash: HashAlgorithm::Sha256,
            encoding: SignatureEncoding::Hex,
        }
    }
}

/// Tenant boundary. Every other record is scoped by `project_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Project {
    pub id: Uuid,
    #[validate(length(min = 1, max = 255, message = "must be 1-255 characters"))]
    pub name: String,
    #[serde(default)]
    #[validate(nested)]
    pub breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub signature: SignatureConfig,
    pub created_at: DateTime<Utc>,
}

impl Project {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            breaker: CircuitBreakerConfig::default(),
            signature: SignatureConfig::default(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    #[must_use]
    pub fn with_signature(mut self, signature: SignatureConfig) -> Self {
        self.signature = signature;
        self
    }
}
