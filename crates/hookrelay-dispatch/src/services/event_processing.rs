//! Subscription matching for ingested events.
//!
//! Consumes `CreateEvent` jobs: every subscription of the event's source (and
//! every any-source subscription) that existed when the event was created is
//! run through the filter engine, and each match becomes its own
//! [`EventDelivery`] with a dispatch job on the delivery queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;
use uuid::Uuid;

use crate::error::WebhookError;
use crate::filter;
use crate::models::{
    DeliveryFilter, DeliveryMetadata, DeliveryStatus, EndpointStatus, Event, EventDelivery,
    EventStatus, Subscription,
};
use crate::queue::{DispatchJob, Job, JobQueue};
use crate::store::Store;

pub struct EventProcessor {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
}

impl EventProcessor {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Match a pending event and schedule its deliveries.
    ///
    /// Re-running for an event whose matching was interrupted reuses the
    /// deliveries already created. Events that completed matching are left
    /// untouched and yield [`WebhookError::EventAlreadyProcessed`].
    #[instrument(skip(self))]
    pub async fn process_event(
        &self,
        project_id: Uuid,
        event_id: Uuid,
    ) -> Result<Vec<EventDelivery>, WebhookError> {
        let event = self
            .store
            .get_event(project_id, event_id)
            .await?
            .ok_or(WebhookError::EventNotFound)?;

        if event.status != EventStatus::Pending {
            return Err(WebhookError::EventAlreadyProcessed);
        }

        let subscriptions = self
            .store
            .list_subscriptions_for_source(project_id, event.source_id)
            .await?;

        let existing: HashMap<Uuid, EventDelivery> = self
            .store
            .list_deliveries(
                project_id,
                &DeliveryFilter {
                    event_id: Some(event.id),
                    ..DeliveryFilter::default()
                },
            )
            .await?
            .into_iter()
            .map(|d| (d.subscription_id, d))
            .collect();

        let mut deliveries = Vec::new();
        let mut endpoint_ids: Vec<Uuid> = Vec::new();

        for subscription in &subscriptions {
            // Subscriptions created after the event never see it.
            if subscription.created_at > event.created_at {
                continue;
            }
            if !filter::matches(&subscription.filter, &event) {
                continue;
            }

            let delivery = match existing.get(&subscription.id) {
                Some(delivery) => delivery.clone(),
                None => match self.create_delivery(&event, subscription).await? {
                    Some(delivery) => delivery,
                    None => continue,
                },
            };

            if delivery.status == DeliveryStatus::Scheduled {
                self.queue
                    .enqueue(Job::DispatchDelivery(dispatch_job(&delivery, false)), None)
                    .await?;
            }
            if !endpoint_ids.contains(&delivery.endpoint_id) {
                endpoint_ids.push(delivery.endpoint_id);
            }
            deliveries.push(delivery);
        }

        let status = if deliveries.is_empty() {
            EventStatus::Failure
        } else {
            EventStatus::Processed
        };
        if !self
            .store
            .complete_event(project_id, event.id, &endpoint_ids, status)
            .await?
        {
            return Err(WebhookError::EventAlreadyProcessed);
        }

        tracing::info!(
            target: "event_processing",
            event_id = %event.id,
            project_id = %project_id,
            event_type = %event.event_type,
            subscription_count = subscriptions.len(),
            delivery_count = deliveries.len(),
            status = status.as_str(),
            "Event matched against subscriptions"
        );

        Ok(deliveries)
    }

    /// Persist the delivery of `event` to the subscription's endpoint.
    ///
    /// Returns `None` when the endpoint no longer exists. Deliveries to an
    /// inactive endpoint are recorded as discarded and never dispatched.
    async fn create_delivery(
        &self,
        event: &Event,
        subscription: &Subscription,
    ) -> Result<Option<EventDelivery>, WebhookError> {
        let Some(endpoint) = self
            .store
            .get_endpoint(event.project_id, subscription.endpoint_id)
            .await?
        else {
            tracing::warn!(
                target: "event_processing",
                event_id = %event.id,
                subscription_id = %subscription.id,
                endpoint_id = %subscription.endpoint_id,
                "Subscription references a missing endpoint"
            );
            return Ok(None);
        };

        let now = Utc::now();
        let status = if endpoint.status == EndpointStatus::Inactive {
            DeliveryStatus::Discarded
        } else {
            DeliveryStatus::Scheduled
        };
        let delivery = EventDelivery {
            id: Uuid::new_v4(),
            project_id: event.project_id,
            event_id: event.id,
            endpoint_id: endpoint.id,
            subscription_id: subscription.id,
            status,
            attempts: 0,
            next_attempt_at: (status == DeliveryStatus::Scheduled).then_some(now),
            metadata: DeliveryMetadata {
                strategy: subscription.retry.strategy,
                interval_secs: subscription.retry.duration_secs,
                retry_limit: subscription.retry.retry_count,
            },
            last_error: (status == DeliveryStatus::Discarded)
                .then(|| "Endpoint is inactive".to_string()),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_delivery(&delivery).await?;
        Ok(Some(delivery))
    }
}

/// The dispatch job for the next attempt of `delivery`.
#[must_use]
pub fn dispatch_job(delivery: &EventDelivery, force: bool) -> DispatchJob {
    DispatchJob {
        delivery_id: delivery.id,
        event_id: delivery.event_id,
        endpoint_id: delivery.endpoint_id,
        subscription_id: delivery.subscription_id,
        project_id: delivery.project_id,
        attempt: delivery.attempts,
        force,
    }
}
