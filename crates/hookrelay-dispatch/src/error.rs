//! Error types for the dispatch pipeline.
//!
//! Ingestion and operator calls return these synchronously. Failures that
//! happen while pushing to an endpoint are never surfaced as errors; they are
//! recorded as delivery attempts and drive the retry decision instead.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use uuid::Uuid;
use validator::{ValidationErrors, ValidationErrorsKind};

use crate::verifier::VerifyError;

/// A single offending input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Every offending field of one request, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldErrors(pub Vec<FieldError>);

impl FieldErrors {
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError::new(field, message));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Names of the offending fields.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        self.0.iter().map(|e| e.field.as_str()).collect()
    }

    /// Start from the outcome of a derived `Validate` check.
    pub fn from_validation(result: Result<(), ValidationErrors>) -> Self {
        result.err().map(Self::from).unwrap_or_default()
    }

    /// `Ok(())` when nothing was collected, the validation error otherwise.
    pub fn into_result(self) -> Result<(), WebhookError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(WebhookError::Validation(self))
        }
    }
}

/// Flattens nested struct errors into dotted paths (`retry.retry_count`),
/// sorted by field name.
impl From<ValidationErrors> for FieldErrors {
    fn from(errors: ValidationErrors) -> Self {
        let mut out = FieldErrors::default();
        collect_validation_errors("", &errors, &mut out);
        out
    }
}

fn collect_validation_errors(prefix: &str, errors: &ValidationErrors, out: &mut FieldErrors) {
    let mut entries: Vec<_> = errors.errors().iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    for (field, kind) in entries {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(errors) => {
                for error in errors {
                    let message = error
                        .message
                        .as_ref()
                        .map_or_else(|| error.code.to_string(), ToString::to_string);
                    out.push(path.clone(), message);
                }
            }
            ValidationErrorsKind::Struct(nested) => collect_validation_errors(&path, nested, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect_validation_errors(&format!("{path}[{index}]"), nested, out);
                }
            }
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Coarse error classes shared by the HTTP layer and the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    AuthFailure,
    Conflict,
    Configuration,
    Internal,
}

/// Dispatch pipeline error variants.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Invalid request: {0}")]
    Validation(FieldErrors),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("SSRF protection: {0}")]
    SsrfDetected(String),

    #[error("Source not found")]
    SourceNotFound,

    #[error("Unsupported source type: {0}")]
    UnsupportedSourceType(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(#[from] VerifyError),

    #[error("Duplicate event")]
    DuplicateEvent { existing_event_id: Uuid },

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Project not found")]
    ProjectNotFound,

    #[error("Event not found")]
    EventNotFound,

    #[error("Endpoint not found")]
    EndpointNotFound,

    #[error("Subscription not found")]
    SubscriptionNotFound,

    #[error("Event delivery not found")]
    EventDeliveryNotFound,

    #[error("Endpoint is paused")]
    EndpointPaused,

    #[error("Endpoint is inactive")]
    EndpointInactive,

    #[error("Event delivery already succeeded")]
    AlreadyDelivered,

    #[error("Event delivery is already scheduled or in progress")]
    DeliveryInFlight,

    #[error("Event has already been processed")]
    EventAlreadyProcessed,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<ValidationErrors> for WebhookError {
    fn from(errors: ValidationErrors) -> Self {
        WebhookError::Validation(errors.into())
    }
}

impl WebhookError {
    /// Shorthand for a validation error on one field.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::default();
        errors.push(field, message);
        WebhookError::Validation(errors)
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            WebhookError::Validation(_)
            | WebhookError::InvalidUrl(_)
            | WebhookError::SsrfDetected(_)
            | WebhookError::PayloadTooLarge { .. } => ErrorKind::Validation,
            WebhookError::SourceNotFound
            | WebhookError::ProjectNotFound
            | WebhookError::EventNotFound
            | WebhookError::EndpointNotFound
            | WebhookError::SubscriptionNotFound
            | WebhookError::EventDeliveryNotFound => ErrorKind::NotFound,
            WebhookError::VerificationFailed(_) => ErrorKind::AuthFailure,
            WebhookError::DuplicateEvent { .. }
            | WebhookError::EndpointPaused
            | WebhookError::EndpointInactive
            | WebhookError::AlreadyDelivered
            | WebhookError::DeliveryInFlight
            | WebhookError::EventAlreadyProcessed => ErrorKind::Conflict,
            WebhookError::UnsupportedSourceType(_) | WebhookError::Configuration(_) => {
                ErrorKind::Configuration
            }
            _ => ErrorKind::Internal,
        }
    }

    /// Returns true if the failure is infrastructure-related and the job that
    /// hit it should be handed back to the queue.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            WebhookError::Store(_) | WebhookError::Queue(_) | WebhookError::HandlerPanicked(_) => {
                true
            }
            #[cfg(feature = "postgres")]
            WebhookError::Database(_) => true,
            #[cfg(feature = "redis")]
            WebhookError::Redis(_) => true,
            _ => false,
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            WebhookError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            WebhookError::InvalidUrl(_) => (StatusCode::BAD_REQUEST, "invalid_url"),
            WebhookError::SsrfDetected(_) => (StatusCode::BAD_REQUEST, "ssrf_detected"),
            WebhookError::SourceNotFound => (StatusCode::NOT_FOUND, "source_not_found"),
            WebhookError::UnsupportedSourceType(_) => {
                (StatusCode::BAD_REQUEST, "unsupported_source_type")
            }
            WebhookError::VerificationFailed(_) => {
                (StatusCode::UNAUTHORIZED, "verification_failed")
            }
            WebhookError::DuplicateEvent { .. } => (StatusCode::CONFLICT, "duplicate_event"),
            WebhookError::PayloadTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large")
            }
            WebhookError::ProjectNotFound => (StatusCode::NOT_FOUND, "project_not_found"),
            WebhookError::EventNotFound => (StatusCode::NOT_FOUND, "event_not_found"),
            WebhookError::EndpointNotFound => (StatusCode::NOT_FOUND, "endpoint_not_found"),
            WebhookError::SubscriptionNotFound => {
                (StatusCode::NOT_FOUND, "subscription_not_found")
            }
            WebhookError::EventDeliveryNotFound => {
                (StatusCode::NOT_FOUND, "event_delivery_not_found")
            }
            WebhookError::EndpointPaused => (StatusCode::CONFLICT, "endpoint_paused"),
            WebhookError::EndpointInactive => (StatusCode::CONFLICT, "endpoint_inactive"),
            WebhookError::AlreadyDelivered => (StatusCode::CONFLICT, "already_delivered"),
            WebhookError::DeliveryInFlight => (StatusCode::CONFLICT, "delivery_in_flight"),
            WebhookError::EventAlreadyProcessed => {
                (StatusCode::CONFLICT, "event_already_processed")
            }
            WebhookError::Configuration(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "configuration_error")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

/// JSON error response returned by the HTTP surface.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldError>>,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_code();

        if status.is_server_error() {
            tracing::error!(target: "http", error = %self, "Request failed");
        }

        // Internal details stay in the logs.
        let message = match self.kind() {
            ErrorKind::Internal => "Internal server error".to_string(),
            _ => self.to_string(),
        };

        let fields = match self {
            WebhookError::Validation(errors) => Some(errors.0),
            _ => None,
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message,
            status: status.as_u16(),
            fields,
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, WebhookError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(WebhookError::SourceNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(
            WebhookError::VerificationFailed(VerifyError::InvalidSignature).kind(),
            ErrorKind::AuthFailure
        );
        assert_eq!(
            WebhookError::UnsupportedSourceType("pub_sub".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            WebhookError::DuplicateEvent {
                existing_event_id: Uuid::new_v4()
            }
            .kind(),
            ErrorKind::Conflict
        );
    }

    #[test]
    fn test_validation_errors_flatten_to_dotted_fields() {
        use validator::Validate;

        #[derive(Validate)]
        struct Inner {
            #[validate(range(min = 1, message = "must be at least 1"))]
            count: u32,
        }

        #[derive(Validate)]
        struct Outer {
            #[validate(length(min = 1, max = 255))]
            name: String,
            #[validate(nested)]
            inner: Inner,
        }

        let errors: FieldErrors = Outer {
            name: String::new(),
            inner: Inner { count: 0 },
        }
        .validate()
        .unwrap_err()
        .into();

        assert_eq!(errors.fields(), vec!["inner.count", "name"]);
        assert_eq!(errors.0[0].message, "must be at least 1");
        // Without a message the validator code is reported.
        assert_eq!(errors.0[1].message, "length");
    }

    #[test]
    fn test_is_transient() {
        assert!(WebhookError::Queue("down".into()).is_transient());
        assert!(WebhookError::Store("down".into()).is_transient());
        assert!(WebhookError::HandlerPanicked("boom".into()).is_transient());
        assert!(!WebhookError::EventNotFound.is_transient());
    }

    #[test]
    fn test_field_errors_display() {
        let mut errors = FieldErrors::default();
        errors.push("failure_threshold", "must be between 0 and 100");
        errors.push("observability_window", "must be greater than 0");
        let err = WebhookError::Validation(errors);
        assert_eq!(
            err.to_string(),
            "Invalid request: failure_threshold: must be between 0 and 100; \
             observability_window: must be greater than 0"
        );
    }

    #[test]
    fn test_into_result() {
        assert!(FieldErrors::default().into_result().is_ok());
        let err = WebhookError::invalid("url", "required");
        match err {
            WebhookError::Validation(fields) => assert_eq!(fields.fields(), vec!["url"]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_status_mapping() {
        let response = WebhookError::PayloadTooLarge {
            size: 10,
            limit: 5,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let response = WebhookError::Store("boom".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
