//! OAuth2 access tokens for endpoints with custom authentication.
//!
//! Tokens are cached per endpoint in a `moka` cache and exchanged again once
//! they come within the refresh margin of their expiry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::models::{OAuth2Config, OAuth2Grant};

/// Maximum number of cached endpoint tokens.
const MAX_CACHE_ENTRIES: u64 = 10_000;

/// Hard upper bound on how long an entry stays cached.
const CACHE_TTL_SECONDS: u64 = 3600;

/// Tokens expiring within this margin are refreshed.
const REFRESH_MARGIN_SECONDS: i64 = 60;

/// Longest lifetime accepted for a signed client assertion.
pub const MAX_ASSERTION_EXPIRY_SECS: u64 = 3600;

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Request(String),

    #[error("token endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    #[error("could not sign client assertion: {0}")]
    Assertion(String),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_expired(&self, margin: chrono::Duration) -> bool {
        Utc::now() + margin >= self.expires_at
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
    jti: String,
}

pub struct TokenService {
    http_client: reqwest::Client,
    cache: Cache<Uuid, CachedToken>,
}

impl TokenService {
    pub fn new(http_client: reqwest::Client) -> Self {
        let cache = Cache::builder()
            .max_capacity(MAX_CACHE_ENTRIES)
            .time_to_live(Duration::from_secs(CACHE_TTL_SECONDS))
            .build();
        Self { http_client, cache }
    }

    /// A valid access token for the endpoint, exchanged when missing or stale.
    #[instrument(skip(self, config), fields(token_url = %config.token_url))]
    pub async fn get_token(
        &self,
        endpoint_id: Uuid,
        config: &OAuth2Config,
    ) -> Result<String, TokenError> {
        let margin = chrono::Duration::seconds(REFRESH_MARGIN_SECONDS);
        if let Some(token) = self.cache.get(&endpoint_id).await {
            if !token.is_expired(margin) {
                debug!("Using cached token");
                return Ok(token.access_token);
            }
        }

        debug!("Exchanging client credentials for access token");
        let token = self.exchange(config).await?;
        self.cache.insert(endpoint_id, token.clone()).await;
        Ok(token.access_token)
    }

    /// Drop the endpoint's cached token.
    pub async fn invalidate(&self, endpoint_id: Uuid) {
        self.cache.invalidate(&endpoint_id).await;
    }

    async fn exchange(&self, config: &OAuth2Config) -> Result<CachedToken, TokenError> {
        let mut params: Vec<(&str, String)> = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", config.client_id.clone()),
        ];
        match &config.grant {
            OAuth2Grant::ClientSecret { client_secret } => {
                params.push(("client_secret", client_secret.clone()));
            }
            OAuth2Grant::ClientAssertion {
                signing_key,
                issuer,
                expiry_secs,
            } => {
                let assertion = sign_assertion(config, signing_key, issuer.as_deref(), *expiry_secs)?;
                params.push(("client_assertion_type", CLIENT_ASSERTION_TYPE.to_string()));
                params.push(("client_assertion", assertion));
            }
        }
        if let Some(scope) = &config.scope {
            params.push(("scope", scope.clone()));
        }
        if let Some(audience) = &config.audience {
            params.push(("audience", audience.clone()));
        }

        let response = self
            .http_client
            .post(&config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| TokenError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Rejected { status, body });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::InvalidResponse(e.to_string()))?;

        // Tokens without an expiry, or with one past the cache lifetime, are
        // cached for the cache lifetime.
        let max_lifetime = CACHE_TTL_SECONDS as i64;
        let lifetime = token
            .expires_in
            .unwrap_or(max_lifetime)
            .clamp(0, max_lifetime);
        let expires_at = Utc::now()
            .checked_add_signed(chrono::Duration::seconds(lifetime))
            .ok_or_else(|| TokenError::InvalidResponse("token expiry out of range".to_string()))?;
        Ok(CachedToken {
            access_token: token.access_token,
            expires_at,
        })
    }
}

fn sign_assertion(
    config: &OAuth2Config,
    signing_key: &str,
    issuer: Option<&str>,
    expiry_secs: u64,
) -> Result<String, TokenError> {
    let now = Utc::now().timestamp();
    let exp = i64::try_from(expiry_secs)
        .ok()
        .and_then(|secs| now.checked_add(secs))
        .ok_or_else(|| TokenError::Assertion(format!("expiry of {expiry_secs}s out of range")))?;
    let claims = AssertionClaims {
        iss: issuer.unwrap_or(&config.client_id),
        sub: &config.client_id,
        aud: config.audience.as_deref().unwrap_or(&config.token_url),
        iat: now,
        exp,
        jti: Uuid::new_v4().to_string(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(signing_key.as_bytes()),
    )
    .map_err(|e| TokenError::Assertion(e.to_string()))
}
