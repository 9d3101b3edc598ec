//! Registration of the records the pipeline dispatches against.
//!
//! Validates projects, sources, endpoints and subscriptions at the boundary so
//! dispatch never sees an unusable URL, filter or retry policy.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

use crate::circuit_breaker::CircuitBreakerManager;
use crate::error::{FieldErrors, WebhookError};
use crate::filter::validate_filter;
use crate::models::{
    AlertConfig, CustomResponse, Endpoint, EndpointAuth, EndpointSecret, EndpointStatus, Project,
    RetryConfig, Source, SourceType, Subscription, SubscriptionFilter, VerifierConfig,
};
use crate::store::Store;
use crate::validation::{
    validate_custom_response, validate_endpoint_auth, validate_endpoint_url,
    validate_idempotency_keys,
};
use crate::verifier::Verifier;

const MASK_ID_LENGTH: usize = 16;
const SECRET_LENGTH: usize = 32;
const SECRET_PREFIX: &str = "whsec_";

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewSource {
    #[validate(length(min = 1, max = 255, message = "must be 1-255 characters"))]
    pub name: String,
    #[serde(default)]
    #[validate(length(min = 1, max = 64, message = "must be 1-64 characters"))]
    pub mask_id: Option<String>,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub idempotency_keys: Vec<String>,
    #[serde(default)]
    pub custom_response: Option<CustomResponse>,
    #[serde(default)]
    #[validate(range(min = 1, message = "must be greater than 0"))]
    pub body_limit_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewEndpoint {
    #[validate(length(min = 1, max = 255, message = "must be 1-255 characters"))]
    pub name: String,
    pub url: String,
    /// Generated when absent.
    #[serde(default)]
    #[validate(length(min = 1, message = "must not be empty"))]
    pub secret: Option<String>,
    #[serde(default)]
    pub auth: Option<EndpointAuth>,
    #[serde(default)]
    #[validate(range(min = 1, message = "must be greater than 0"))]
    pub http_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewSubscription {
    #[validate(length(min = 1, max = 255, message = "must be 1-255 characters"))]
    pub name: String,
    #[serde(default)]
    pub source_id: Option<Uuid>,
    pub endpoint_id: Uuid,
    #[serde(default)]
    pub filter: SubscriptionFilter,
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub alert: AlertConfig,
}

pub struct CatalogService {
    store: Arc<dyn Store>,
    breakers: Arc<CircuitBreakerManager>,
    allow_http: bool,
    allow_private: bool,
}

impl CatalogService {
    pub fn new(
        store: Arc<dyn Store>,
        breakers: Arc<CircuitBreakerManager>,
        allow_http: bool,
        allow_private: bool,
    ) -> Self {
        Self {
            store,
            breakers,
            allow_http,
            allow_private,
        }
    }

    pub async fn create_project(&self, project: Project) -> Result<Project, WebhookError> {
        project.validate()?;

        self.store.insert_project(&project).await?;
        tracing::info!(
            target: "operator",
            project_id = %project.id,
            name = %project.name,
            "Project created"
        );
        Ok(project)
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_source(
        &self,
        project_id: Uuid,
        input: NewSource,
    ) -> Result<Source, WebhookError> {
        self.require_project(project_id).await?;

        let mut errors = FieldErrors::from_validation(input.validate());
        validate_idempotency_keys(&input.idempotency_keys, &mut errors);
        if let Err(e) = Verifier::from_config(&input.verifier) {
            errors.push("verifier", e.to_string());
        }
        if let Some(mask_id) = &input.mask_id {
            if !mask_id.chars().all(|c| c.is_ascii_alphanumeric()) {
                errors.push("mask_id", "must be alphanumeric");
            }
        }
        if let Some(custom) = &input.custom_response {
            validate_custom_response(custom, &mut errors);
        }
        errors.into_result()?;

        let source = Source {
            id: Uuid::new_v4(),
            project_id,
            mask_id: input.mask_id.unwrap_or_else(|| random_token(MASK_ID_LENGTH)),
            name: input.name,
            source_type: input.source_type,
            verifier: input.verifier,
            idempotency_keys: input.idempotency_keys,
            custom_response: input.custom_response,
            body_limit_bytes: input.body_limit_bytes,
            created_at: Utc::now(),
        };
        self.store.insert_source(&source).await?;
        tracing::info!(
            target: "operator",
            source_id = %source.id,
            project_id = %project_id,
            mask_id = %source.mask_id,
            "Source created"
        );
        Ok(source)
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_endpoint(
        &self,
        project_id: Uuid,
        input: NewEndpoint,
    ) -> Result<Endpoint, WebhookError> {
        self.require_project(project_id).await?;

        let mut errors = FieldErrors::from_validation(input.validate());
        if let Some(auth) = &input.auth {
            validate_endpoint_auth(auth, &mut errors);
        }
        errors.into_result()?;
        validate_endpoint_url(&input.url, self.allow_http, self.allow_private)?;

        let endpoint = Endpoint {
            id: Uuid::new_v4(),
            project_id,
            name: input.name,
            url: input.url,
            secrets: vec![EndpointSecret::new(
                input.secret.unwrap_or_else(generate_secret),
            )],
            status: EndpointStatus::Active,
            auth: input.auth,
            http_timeout_secs: input.http_timeout_secs,
            created_at: Utc::now(),
        };
        self.store.insert_endpoint(&endpoint).await?;
        tracing::info!(
            target: "operator",
            endpoint_id = %endpoint.id,
            project_id = %project_id,
            "Endpoint created"
        );
        Ok(endpoint)
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_subscription(
        &self,
        project_id: Uuid,
        input: NewSubscription,
    ) -> Result<Subscription, WebhookError> {
        let mut errors = FieldErrors::from_validation(input.validate());
        errors.0.extend(validate_filter(&input.filter).0);
        errors.into_result()?;

        self.store
            .get_endpoint(project_id, input.endpoint_id)
            .await?
            .ok_or(WebhookError::EndpointNotFound)?;
        if let Some(source_id) = input.source_id {
            self.store
                .get_source(project_id, source_id)
                .await?
                .ok_or(WebhookError::SourceNotFound)?;
        }

        let subscription = Subscription {
            id: Uuid::new_v4(),
            project_id,
            name: input.name,
            source_id: input.source_id,
            endpoint_id: input.endpoint_id,
            filter: input.filter,
            retry: input.retry,
            alert: input.alert,
            created_at: Utc::now(),
        };
        self.store.insert_subscription(&subscription).await?;
        tracing::info!(
            target: "operator",
            subscription_id = %subscription.id,
            endpoint_id = %subscription.endpoint_id,
            "Subscription created"
        );
        Ok(subscription)
    }

    pub async fn pause_endpoint(&self, project_id: Uuid, endpoint_id: Uuid) -> Result<(), WebhookError> {
        self.set_endpoint_status(project_id, endpoint_id, EndpointStatus::Paused)
            .await
    }

    pub async fn activate_endpoint(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<(), WebhookError> {
        self.set_endpoint_status(project_id, endpoint_id, EndpointStatus::Active)
            .await
    }

    async fn set_endpoint_status(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
        status: EndpointStatus,
    ) -> Result<(), WebhookError> {
        if !self
            .store
            .update_endpoint_status(project_id, endpoint_id, status)
            .await?
        {
            return Err(WebhookError::EndpointNotFound);
        }
        tracing::info!(
            target: "operator",
            endpoint_id = %endpoint_id,
            status = status.as_str(),
            "Endpoint status changed"
        );
        Ok(())
    }

    /// Add a new signing secret. Current secrets stay valid for `grace` so
    /// receivers can roll over.
    pub async fn rotate_endpoint_secret(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
        grace: Duration,
    ) -> Result<EndpointSecret, WebhookError> {
        let endpoint = self
            .store
            .get_endpoint(project_id, endpoint_id)
            .await?
            .ok_or(WebhookError::EndpointNotFound)?;

        let now = Utc::now();
        let retire_at = now + grace;
        let mut secrets: Vec<EndpointSecret> = endpoint
            .secrets
            .into_iter()
            .filter(|s| s.is_active(now))
            .map(|mut s| {
                s.expires_at = Some(s.expires_at.map_or(retire_at, |e| e.min(retire_at)));
                s
            })
            .collect();
        let secret = EndpointSecret::new(generate_secret());
        secrets.push(secret.clone());

        self.store
            .update_endpoint_secrets(project_id, endpoint_id, &secrets)
            .await?;
        tracing::info!(
            target: "operator",
            endpoint_id = %endpoint_id,
            retiring = secrets.len() - 1,
            "Endpoint secret rotated"
        );
        Ok(secret)
    }

    /// Delete an endpoint with its subscriptions. Pending deliveries are
    /// discarded and its breaker state dropped.
    #[instrument(skip(self))]
    pub async fn delete_endpoint(&self, project_id: Uuid, endpoint_id: Uuid) -> Result<(), WebhookError> {
        self.store
            .get_endpoint(project_id, endpoint_id)
            .await?
            .ok_or(WebhookError::EndpointNotFound)?;

        let discarded = self
            .store
            .discard_pending_deliveries(project_id, endpoint_id)
            .await?;
        self.store.delete_endpoint(project_id, endpoint_id).await?;
        self.breakers.invalidate(project_id, &[endpoint_id]).await?;

        tracing::info!(
            target: "operator",
            endpoint_id = %endpoint_id,
            discarded,
            "Endpoint deleted"
        );
        Ok(())
    }

    pub async fn delete_subscription(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<(), WebhookError> {
        if self
            .store
            .delete_subscription(project_id, subscription_id)
            .await?
        {
            Ok(())
        } else {
            Err(WebhookError::SubscriptionNotFound)
        }
    }

    async fn require_project(&self, project_id: Uuid) -> Result<(), WebhookError> {
        self.store
            .get_project(project_id)
            .await?
            .map(|_| ())
            .ok_or(WebhookError::ProjectNotFound)
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn generate_secret() -> String {
    format!("{SECRET_PREFIX}{}", random_token(SECRET_LENGTH))
}
