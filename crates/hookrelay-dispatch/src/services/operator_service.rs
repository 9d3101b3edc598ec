//! Operator actions on the dispatch pipeline.
//!
//! Manual resend, batch retry and force resend reschedule deliveries as
//! individual dispatch jobs. Batch calls never abort on one bad item; the
//! [`BatchReport`] carries the per-item tally. Breaker administration reads,
//! resets and reconfigures the per-endpoint circuit breakers of a project.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager, CircuitBreakerStatus};
use crate::error::WebhookError;
use crate::models::{
    DeliveryAttempt, DeliveryFilter, DeliveryStatus, EndpointStatus, EventDelivery,
};
use crate::queue::{Job, JobQueue};
use crate::services::event_processing::{dispatch_job, EventProcessor};
use crate::store::Store;

/// Tally of a batch operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub successful: u64,
    pub failed: u64,
    /// Deliveries that had already succeeded and were left alone.
    pub already_delivered: u64,
}

impl BatchReport {
    #[must_use]
    pub fn message(&self) -> String {
        format!("{} successful, {} failed", self.successful, self.failed)
    }
}

/// Partial breaker configuration update. Absent fields keep their value.
///
/// Fields are signed so out-of-range input reaches validation instead of
/// failing deserialization.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct BreakerConfigUpdate {
    #[validate(range(
        exclusive_min = 0.0,
        max = 1.0,
        message = "must be greater than 0 and at most 1"
    ))]
    pub sample_rate: Option<f64>,
    #[validate(range(min = 1, max = 4294967295_i64, message = "must be between 1 and 4294967295"))]
    pub error_timeout: Option<i64>,
    #[validate(range(min = 0, max = 100, message = "must be between 0 and 100"))]
    pub failure_threshold: Option<i64>,
    #[validate(range(min = 0, max = 100, message = "must be between 0 and 100"))]
    pub success_threshold: Option<i64>,
    #[validate(range(min = 1, max = 4294967295_i64, message = "must be between 1 and 4294967295"))]
    pub observability_window: Option<i64>,
    #[validate(range(min = 0, max = 4294967295_i64, message = "must be between 0 and 4294967295"))]
    pub minimum_request_count: Option<i64>,
    #[validate(range(min = 0, max = 4294967295_i64, message = "must be between 0 and 4294967295"))]
    pub consecutive_failure_threshold: Option<i64>,
}

impl BreakerConfigUpdate {
    /// Apply onto `current`. Every offending field is reported at once.
    pub fn apply(&self, current: &CircuitBreakerConfig) -> Result<CircuitBreakerConfig, WebhookError> {
        self.validate()?;

        // Ranges were checked above, so the narrowing casts are lossless.
        let mut config = current.clone();
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if let Some(v) = self.error_timeout {
            config.error_timeout_secs = v as u64;
        }
        if let Some(v) = self.failure_threshold {
            config.failure_threshold = v as u32;
        }
        if let Some(v) = self.success_threshold {
            config.success_threshold = v as u32;
        }
        if let Some(v) = self.observability_window {
            config.observability_window_secs = v as u64;
        }
        if let Some(v) = self.minimum_request_count {
            config.minimum_request_count = v as u32;
        }
        if let Some(v) = self.consecutive_failure_threshold {
            config.consecutive_failure_threshold = v as u32;
        }

        config.validate()?;
        Ok(config)
    }
}

pub struct OperatorService {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    breakers: Arc<CircuitBreakerManager>,
    processor: Arc<EventProcessor>,
}

impl OperatorService {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        breakers: Arc<CircuitBreakerManager>,
        processor: Arc<EventProcessor>,
    ) -> Self {
        Self {
            store,
            queue,
            breakers,
            processor,
        }
    }

    // ------------------------------------------------------------------
    // Resend
    // ------------------------------------------------------------------

    /// Reschedule a failed or discarded delivery.
    #[instrument(skip(self))]
    pub async fn resend(
        &self,
        project_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<EventDelivery, WebhookError> {
        let delivery = self.load_delivery(project_id, delivery_id).await?;
        match delivery.status {
            DeliveryStatus::Success => return Err(WebhookError::AlreadyDelivered),
            DeliveryStatus::Scheduled | DeliveryStatus::Processing => {
                return Err(WebhookError::DeliveryInFlight)
            }
            DeliveryStatus::Failure | DeliveryStatus::Discarded => {}
        }
        self.ensure_endpoint_active(project_id, delivery.endpoint_id)
            .await?;
        self.reschedule(delivery, false).await
    }

    /// Resend every delivery matching `filter`. An empty status filter
    /// selects failed deliveries.
    #[instrument(skip(self, filter))]
    pub async fn batch_retry(
        &self,
        project_id: Uuid,
        filter: DeliveryFilter,
    ) -> Result<BatchReport, WebhookError> {
        let mut filter = filter;
        if filter.status.is_empty() {
            filter.status = vec![DeliveryStatus::Failure];
        }
        let deliveries = self.store.list_deliveries(project_id, &filter).await?;

        let mut report = BatchReport::default();
        for delivery in deliveries {
            match self.resend(project_id, delivery.id).await {
                Ok(_) => report.successful += 1,
                Err(WebhookError::AlreadyDelivered) => report.already_delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        target: "operator",
                        delivery_id = %delivery.id,
                        error = %e,
                        "Batch retry item failed"
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            target: "operator",
            project_id = %project_id,
            successful = report.successful,
            failed = report.failed,
            already_delivered = report.already_delivered,
            "Batch retry completed"
        );
        Ok(report)
    }

    /// Resend deliveries regardless of breaker state and retry budget.
    #[instrument(skip(self, delivery_ids), fields(count = delivery_ids.len()))]
    pub async fn force_resend(
        &self,
        project_id: Uuid,
        delivery_ids: &[Uuid],
    ) -> Result<BatchReport, WebhookError> {
        let mut report = BatchReport::default();
        for delivery_id in delivery_ids {
            match self.force_one(project_id, *delivery_id).await {
                Ok(_) => report.successful += 1,
                Err(WebhookError::AlreadyDelivered) => report.already_delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        target: "operator",
                        delivery_id = %delivery_id,
                        error = %e,
                        "Force resend item failed"
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            target: "operator",
            project_id = %project_id,
            successful = report.successful,
            failed = report.failed,
            already_delivered = report.already_delivered,
            "Force resend completed"
        );
        Ok(report)
    }

    async fn force_one(
        &self,
        project_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<EventDelivery, WebhookError> {
        let delivery = self.load_delivery(project_id, delivery_id).await?;
        match delivery.status {
            DeliveryStatus::Success => return Err(WebhookError::AlreadyDelivered),
            DeliveryStatus::Processing => return Err(WebhookError::DeliveryInFlight),
            _ => {}
        }
        self.ensure_endpoint_active(project_id, delivery.endpoint_id)
            .await?;
        self.reschedule(delivery, true).await
    }

    /// Mark the delivery scheduled and enqueue its next attempt. The stored
    /// record is restored when the enqueue fails.
    async fn reschedule(
        &self,
        delivery: EventDelivery,
        force: bool,
    ) -> Result<EventDelivery, WebhookError> {
        let previous = delivery.clone();
        let mut delivery = delivery;
        let now = Utc::now();

        // One more attempt for deliveries that used up their budget.
        if delivery.attempts >= delivery.metadata.retry_limit {
            delivery.metadata.retry_limit = delivery.attempts + 1;
        }
        delivery.status = DeliveryStatus::Scheduled;
        delivery.next_attempt_at = Some(now);
        delivery.updated_at = now;
        self.store.update_delivery(&delivery).await?;

        if let Err(e) = self
            .queue
            .enqueue(Job::DispatchDelivery(dispatch_job(&delivery, force)), None)
            .await
        {
            self.store.update_delivery(&previous).await?;
            return Err(e);
        }

        tracing::info!(
            target: "operator",
            delivery_id = %delivery.id,
            endpoint_id = %delivery.endpoint_id,
            force,
            "Delivery rescheduled"
        );
        Ok(delivery)
    }

    async fn load_delivery(
        &self,
        project_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<EventDelivery, WebhookError> {
        self.store
            .get_delivery(project_id, delivery_id)
            .await?
            .ok_or(WebhookError::EventDeliveryNotFound)
    }

    async fn ensure_endpoint_active(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<(), WebhookError> {
        let endpoint = self
            .store
            .get_endpoint(project_id, endpoint_id)
            .await?
            .ok_or(WebhookError::EndpointNotFound)?;
        match endpoint.status {
            EndpointStatus::Active => Ok(()),
            EndpointStatus::Paused => Err(WebhookError::EndpointPaused),
            EndpointStatus::Inactive => Err(WebhookError::EndpointInactive),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn list_deliveries(
        &self,
        project_id: Uuid,
        filter: &DeliveryFilter,
    ) -> Result<Vec<EventDelivery>, WebhookError> {
        self.store.list_deliveries(project_id, filter).await
    }

    pub async fn get_delivery(
        &self,
        project_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<EventDelivery, WebhookError> {
        self.load_delivery(project_id, delivery_id).await
    }

    pub async fn list_attempts(
        &self,
        project_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Vec<DeliveryAttempt>, WebhookError> {
        self.load_delivery(project_id, delivery_id).await?;
        self.store.list_attempts(project_id, delivery_id).await
    }

    /// Re-run matching for an event whose matching never completed.
    pub async fn replay_event(
        &self,
        project_id: Uuid,
        event_id: Uuid,
    ) -> Result<Vec<EventDelivery>, WebhookError> {
        self.processor.process_event(project_id, event_id).await
    }

    // ------------------------------------------------------------------
    // Circuit breakers
    // ------------------------------------------------------------------

    /// Update a project's breaker thresholds and clear the stored state of
    /// all its endpoints so the new thresholds apply immediately.
    #[instrument(skip(self, update))]
    pub async fn update_breaker_config(
        &self,
        project_id: Uuid,
        update: &BreakerConfigUpdate,
    ) -> Result<CircuitBreakerConfig, WebhookError> {
        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or(WebhookError::ProjectNotFound)?;
        let config = update.apply(&project.breaker)?;

        self.store.update_project_breaker(project_id, &config).await?;

        let endpoint_ids: Vec<Uuid> = self
            .store
            .list_endpoints(project_id)
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect();
        self.breakers.invalidate(project_id, &endpoint_ids).await?;

        tracing::info!(
            target: "operator",
            project_id = %project_id,
            endpoints = endpoint_ids.len(),
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            observability_window = config.observability_window_secs,
            "Circuit breaker configuration updated"
        );
        Ok(config)
    }

    pub async fn breaker_status(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<CircuitBreakerStatus, WebhookError> {
        self.store
            .get_endpoint(project_id, endpoint_id)
            .await?
            .ok_or(WebhookError::EndpointNotFound)?;
        Ok(self
            .breakers
            .state(project_id, endpoint_id)
            .await?
            .map_or_else(|| CircuitBreakerStatus::closed(endpoint_id), |s| (&s).into()))
    }

    pub async fn list_breakers(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<CircuitBreakerStatus>, WebhookError> {
        let endpoints = self.store.list_endpoints(project_id).await?;
        let mut statuses = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let status = self
                .breakers
                .state(project_id, endpoint.id)
                .await?
                .map_or_else(|| CircuitBreakerStatus::closed(endpoint.id), |s| (&s).into());
            statuses.push(status);
        }
        Ok(statuses)
    }

    /// Reset breakers to closed. An empty list resets every endpoint of the
    /// project; ids of other projects' endpoints are ignored.
    #[instrument(skip(self, endpoint_ids))]
    pub async fn reset_breakers(
        &self,
        project_id: Uuid,
        endpoint_ids: &[Uuid],
    ) -> Result<Vec<Uuid>, WebhookError> {
        let owned: Vec<Uuid> = self
            .store
            .list_endpoints(project_id)
            .await?
            .into_iter()
            .map(|e| e.id)
            .filter(|id| endpoint_ids.is_empty() || endpoint_ids.contains(id))
            .collect();
        self.breakers.reset(project_id, &owned).await?;

        tracing::info!(
            target: "operator",
            project_id = %project_id,
            endpoints = owned.len(),
            "Circuit breakers reset"
        );
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_report_message() {
        let report = BatchReport {
            successful: 2,
            failed: 1,
            already_delivered: 4,
        };
        assert_eq!(report.message(), "2 successful, 1 failed");
    }

    #[test]
    fn test_update_applies_present_fields_only() {
        let update = BreakerConfigUpdate {
            failure_threshold: Some(50),
            consecutive_failure_threshold: Some(3),
            ..BreakerConfigUpdate::default()
        };
        let config = update.apply(&CircuitBreakerConfig::default()).unwrap();
        assert_eq!(config.failure_threshold, 50);
        assert_eq!(config.consecutive_failure_threshold, 3);
        assert_eq!(
            config.observability_window_secs,
            CircuitBreakerConfig::default().observability_window_secs
        );
    }

    #[test]
    fn test_update_names_every_offending_field() {
        let update = BreakerConfigUpdate {
            failure_threshold: Some(101),
            success_threshold: Some(-1),
            observability_window: Some(0),
            ..BreakerConfigUpdate::default()
        };
        let Err(WebhookError::Validation(errors)) = update.apply(&CircuitBreakerConfig::default())
        else {
            panic!("expected validation error");
        };
        assert_eq!(
            errors.fields(),
            vec!["failure_threshold", "observability_window", "success_threshold"]
        );
    }

    #[test]
    fn test_update_rejects_bad_sample_rate() {
        for rate in [0.0, 1.5] {
            let update = BreakerConfigUpdate {
                sample_rate: Some(rate),
                ..BreakerConfigUpdate::default()
            };
            let Err(WebhookError::Validation(errors)) =
                update.apply(&CircuitBreakerConfig::default())
            else {
                panic!("expected validation error for {rate}");
            };
            assert_eq!(errors.fields(), vec!["sample_rate"]);
        }
    }

    #[test]
    fn test_update_rejects_timeouts_beyond_u32() {
        let update = BreakerConfigUpdate {
            error_timeout: Some(i64::from(u32::MAX) + 1),
            ..BreakerConfigUpdate::default()
        };
        let Err(WebhookError::Validation(errors)) = update.apply(&CircuitBreakerConfig::default())
        else {
            panic!("expected validation error");
        };
        assert_eq!(errors.fields(), vec!["error_timeout"]);
        assert_eq!(errors.0[0].message, "must be between 1 and 4294967295");
    }
}
