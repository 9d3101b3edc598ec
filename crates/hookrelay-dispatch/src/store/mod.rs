//! Relational persistence for projects, sources, endpoints, subscriptions,
//! events, deliveries and attempts.
//!
//! Every lookup is scoped by project so one tenant can never read another's
//! records.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::WebhookError;
use crate::models::{
    DeliveryAttempt, DeliveryFilter, Endpoint, EndpointSecret, EndpointStatus, Event,
    EventDelivery, EventStatus, Project, Source, Subscription,
};

#[async_trait]
pub trait Store: Send + Sync {
    // -- projects ----------------------------------------------------------

    async fn insert_project(&self, project: &Project) -> Result<(), WebhookError>;

    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, WebhookError>;

    async fn update_project_breaker(
        &self,
        project_id: Uuid,
        config: &CircuitBreakerConfig,
    ) -> Result<(), WebhookError>;

    // -- sources -----------------------------------------------------------

    async fn insert_source(&self, source: &Source) -> Result<(), WebhookError>;

    async fn get_source_by_mask(&self, mask_id: &str) -> Result<Option<Source>, WebhookError>;

    async fn get_source(
        &self,
        project_id: Uuid,
        source_id: Uuid,
    ) -> Result<Option<Source>, WebhookError>;

    // -- endpoints ---------------------------------------------------------

    async fn insert_endpoint(&self, endpoint: &Endpoint) -> Result<(), WebhookError>;

    async fn get_endpoint(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<Option<Endpoint>, WebhookError>;

    async fn list_endpoints(&self, project_id: Uuid) -> Result<Vec<Endpoint>, WebhookError>;

    async fn update_endpoint_status(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
        status: EndpointStatus,
    ) -> Result<bool, WebhookError>;

    async fn update_endpoint_secrets(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
        secrets: &[EndpointSecret],
    ) -> Result<bool, WebhookError>;

    /// Delete the endpoint and its subscriptions.
    async fn delete_endpoint(&self, project_id: Uuid, endpoint_id: Uuid)
        -> Result<bool, WebhookError>;

    // -- subscriptions -----------------------------------------------------

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), WebhookError>;

    async fn get_subscription(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, WebhookError>;

    /// Subscriptions bound to `source_id` plus those bound to any source,
    /// oldest first.
    async fn list_subscriptions_for_source(
        &self,
        project_id: Uuid,
        source_id: Option<Uuid>,
    ) -> Result<Vec<Subscription>, WebhookError>;

    async fn delete_subscription(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<bool, WebhookError>;

    // -- events ------------------------------------------------------------

    async fn insert_event(&self, event: &Event) -> Result<(), WebhookError>;

    async fn get_event(&self, project_id: Uuid, event_id: Uuid)
        -> Result<Option<Event>, WebhookError>;

    async fn find_event_by_idempotency_key(
        &self,
        project_id: Uuid,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Event>, WebhookError>;

    /// Record the matching result of a pending event. Returns false when the
    /// event was no longer pending, leaving it untouched.
    async fn complete_event(
        &self,
        project_id: Uuid,
        event_id: Uuid,
        endpoint_ids: &[Uuid],
        status: EventStatus,
    ) -> Result<bool, WebhookError>;

    // -- deliveries --------------------------------------------------------

    async fn insert_delivery(&self, delivery: &EventDelivery) -> Result<(), WebhookError>;

    async fn get_delivery(
        &self,
        project_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Option<EventDelivery>, WebhookError>;

    async fn update_delivery(&self, delivery: &EventDelivery) -> Result<(), WebhookError>;

    /// Matching deliveries, oldest first.
    async fn list_deliveries(
        &self,
        project_id: Uuid,
        filter: &DeliveryFilter,
    ) -> Result<Vec<EventDelivery>, WebhookError>;

    /// Mark every non-terminal delivery of an endpoint discarded.
    async fn discard_pending_deliveries(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<u64, WebhookError>;

    // -- attempts ----------------------------------------------------------

    async fn insert_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), WebhookError>;

    /// Attempts of one delivery in creation order.
    async fn list_attempts(
        &self,
        project_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Vec<DeliveryAttempt>, WebhookError>;
}
