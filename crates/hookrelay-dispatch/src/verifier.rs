//! Inbound request verification.
//!
//! Each source carries a [`VerifierConfig`]; [`Verifier::from_config`] turns it
//! into a concrete verifier and [`Verifier::verify`] checks one request.
//! Provider names resolve to HMAC verifiers with vendor-specific header,
//! encoding and prefix.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::crypto::{compute_hmac, constant_time_eq, HashAlgorithm, SignatureEncoding};
use crate::error::WebhookError;
use crate::models::{HmacConfig, InboundRequest, VerifierConfig};

/// Why an inbound request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("missing header: {0}")]
    MissingHeader(String),

    #[error("signature does not match")]
    InvalidSignature,

    #[error("malformed signature")]
    MalformedSignature,

    #[error("invalid credentials")]
    InvalidCredentials,
}

/// Known vendor signature schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Github,
    Shopify,
    Twitter,
}

impl Provider {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "github" => Some(Self::Github),
            "shopify" => Some(Self::Shopify),
            "twitter" => Some(Self::Twitter),
            _ => None,
        }
    }

    /// The HMAC verifier this provider signs with.
    fn hmac(self, secret: &str) -> HmacVerifier {
        let (header, encoding, prefix) = match self {
            Self::Github => ("x-hub-signature-256", SignatureEncoding::Hex, Some("sha256=")),
            Self::Shopify => ("x-shopify-hmac-sha256", SignatureEncoding::Base64, None),
            Self::Twitter => (
                "x-twitter-webhooks-signature",
                SignatureEncoding::Base64,
                Some("sha256="),
            ),
        };
        HmacVerifier {
            header: header.to_string(),
            secret: secret.to_string(),
            hash: HashAlgorithm::Sha256,
            encoding,
            prefix: prefix.map(str::to_string),
        }
    }
}

/// HMAC over the raw request body.
#[derive(Debug, Clone)]
pub struct HmacVerifier {
    header: String,
    secret: String,
    hash: HashAlgorithm,
    encoding: SignatureEncoding,
    prefix: Option<String>,
}

impl HmacVerifier {
    fn from_config(config: &HmacConfig) -> Self {
        Self {
            header: config.header.to_ascii_lowercase(),
            secret: config.secret.clone(),
            hash: config.hash,
            encoding: config.encoding,
            prefix: config.prefix.clone(),
        }
    }

    fn verify(&self, request: &InboundRequest) -> Result<(), VerifyError> {
        let value = request
            .header(&self.header)
            .ok_or_else(|| VerifyError::MissingHeader(self.header.clone()))?;

        let encoded = match &self.prefix {
            Some(prefix) => value
                .strip_prefix(prefix.as_str())
                .ok_or(VerifyError::MalformedSignature)?,
            None => value,
        };

        let provided = self
            .encoding
            .decode(encoded)
            .ok_or(VerifyError::MalformedSignature)?;

        let expected = compute_hmac(self.hash, self.secret.as_bytes(), &[&request.body]);
        if constant_time_eq(&provided, &expected) {
            Ok(())
        } else {
            Err(VerifyError::InvalidSignature)
        }
    }
}

/// A source's verification strategy.
#[derive(Debug, Clone)]
pub enum Verifier {
    Noop,
    Hmac(HmacVerifier),
    BasicAuth { username: String, password: String },
    ApiKey { header: String, key: String },
}

impl Verifier {
    /// Resolve a verifier from source configuration.
    ///
    /// An unknown provider name is a configuration problem of the source, not
    /// an authentication failure of the request.
    pub fn from_config(config: &VerifierConfig) -> Result<Self, WebhookError> {
        Ok(match config {
            VerifierConfig::Noop => Self::Noop,
            VerifierConfig::Hmac(hmac) => Self::Hmac(HmacVerifier::from_config(hmac)),
            VerifierConfig::BasicAuth { username, password } => Self::BasicAuth {
                username: username.clone(),
                password: password.clone(),
            },
            VerifierConfig::ApiKey { header, key } => Self::ApiKey {
                header: header.to_ascii_lowercase(),
                key: key.clone(),
            },
            VerifierConfig::Provider { name, secret } => {
                let provider = Provider::parse(name).ok_or_else(|| {
                    WebhookError::Configuration(format!("unsupported verifier provider: {name}"))
                })?;
                Self::Hmac(provider.hmac(secret))
            }
        })
    }

    /// Check one inbound request.
    pub fn verify(&self, request: &InboundRequest) -> Result<(), VerifyError> {
        match self {
            Self::Noop => Ok(()),
            Self::Hmac(hmac) => hmac.verify(request),
            Self::BasicAuth { username, password } => {
                let value = request
                    .header("authorization")
                    .ok_or_else(|| VerifyError::MissingHeader("authorization".to_string()))?;
                let encoded = value
                    .strip_prefix("Basic ")
                    .ok_or(VerifyError::MalformedSignature)?;
                let decoded = BASE64
                    .decode(encoded.trim())
                    .map_err(|_| VerifyError::MalformedSignature)?;
                let expected = format!("{username}:{password}");
                if constant_time_eq(&decoded, expected.as_bytes()) {
                    Ok(())
                } else {
                    Err(VerifyError::InvalidCredentials)
                }
            }
            Self::ApiKey { header, key } => {
                let value = request
                    .header(header)
                    .ok_or_else(|| VerifyError::MissingHeader(header.clone()))?;
                if constant_time_eq(value.as_bytes(), key.as_bytes()) {
                    Ok(())
                } else {
                    Err(VerifyError::InvalidCredentials)
                }
            }
        }
    }
}
