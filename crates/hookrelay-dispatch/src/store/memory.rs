use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Store;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::WebhookError;
use crate::models::{
    DeliveryAttempt, DeliveryFilter, DeliveryStatus, Endpoint, EndpointSecret, EndpointStatus,
    Event, EventDelivery, EventStatus, Project, Source, Subscription,
};

#[derive(Debug, Default)]
struct Tables {
    projects: HashMap<Uuid, Project>,
    sources: HashMap<Uuid, Source>,
    endpoints: HashMap<Uuid, Endpoint>,
    subscriptions: HashMap<Uuid, Subscription>,
    events: HashMap<Uuid, Event>,
    deliveries: HashMap<Uuid, EventDelivery>,
    attempts: Vec<DeliveryAttempt>,
}

/// In-process store. Default backend and the one tests run against.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn scoped<T>(record: Option<&T>, project_id: Uuid, owner: impl Fn(&T) -> Uuid) -> Option<T>
where
    T: Clone,
{
    record.filter(|r| owner(r) == project_id).cloned()
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_project(&self, project: &Project) -> Result<(), WebhookError> {
        self.tables
            .write()
            .await
            .projects
            .insert(project.id, project.clone());
        Ok(())
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, WebhookError> {
        Ok(self.tables.read().await.projects.get(&project_id).cloned())
    }

    async fn update_project_breaker(
        &self,
        project_id: Uuid,
        config: &CircuitBreakerConfig,
    ) -> Result<(), WebhookError> {
        let mut tables = self.tables.write().await;
        let project = tables
            .projects
            .get_mut(&project_id)
            .ok_or(WebhookError::ProjectNotFound)?;
        project.breaker = config.clone();
        Ok(())
    }

    async fn insert_source(&self, source: &Source) -> Result<(), WebhookError> {
        let mut tables = self.tables.write().await;
        if tables.sources.values().any(|s| s.mask_id == source.mask_id) {
            return Err(WebhookError::invalid("mask_id", "already in use"));
        }
        tables.sources.insert(source.id, source.clone());
        Ok(())
    }

    async fn get_source_by_mask(&self, mask_id: &str) -> Result<Option<Source>, WebhookError> {
        Ok(self
            .tables
            .read()
            .await
            .sources
            .values()
            .find(|s| s.mask_id == mask_id)
            .cloned())
    }

    async fn get_source(
        &self,
        project_id: Uuid,
        source_id: Uuid,
    ) -> Result<Option<Source>, WebhookError> {
        let tables = self.tables.read().await;
        Ok(scoped(tables.sources.get(&source_id), project_id, |s| {
            s.project_id
        }))
    }

    async fn insert_endpoint(&self, endpoint: &Endpoint) -> Result<(), WebhookError> {
        self.tables
            .write()
            .await
            .endpoints
            .insert(endpoint.id, endpoint.clone());
        Ok(())
    }

    async fn get_endpoint(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<Option<Endpoint>, WebhookError> {
        let tables = self.tables.read().await;
        Ok(scoped(tables.endpoints.get(&endpoint_id), project_id, |e| {
            e.project_id
        }))
    }

    async fn list_endpoints(&self, project_id: Uuid) -> Result<Vec<Endpoint>, WebhookError> {
        let tables = self.tables.read().await;
        let mut endpoints: Vec<Endpoint> = tables
            .endpoints
            .values()
            .filter(|e| e.project_id == project_id)
            .cloned()
            .collect();
        endpoints.sort_by_key(|e| e.created_at);
        Ok(endpoints)
    }

    async fn update_endpoint_status(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
        status: EndpointStatus,
    ) -> Result<bool, WebhookError> {
        let mut tables = self.tables.write().await;
        match tables.endpoints.get_mut(&endpoint_id) {
            Some(endpoint) if endpoint.project_id == project_id => {
                endpoint.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_endpoint_secrets(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
        secrets: &[EndpointSecret],
    ) -> Result<bool, WebhookError> {
        let mut tables = self.tables.write().await;
        match tables.endpoints.get_mut(&endpoint_id) {
            Some(endpoint) if endpoint.project_id == project_id => {
                endpoint.secrets = secrets.to_vec();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_endpoint(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<bool, WebhookError> {
        let mut tables = self.tables.write().await;
        let owned = tables
            .endpoints
            .get(&endpoint_id)
            .is_some_and(|e| e.project_id == project_id);
        if !owned {
            return Ok(false);
        }
        tables.endpoints.remove(&endpoint_id);
        tables
            .subscriptions
            .retain(|_, s| !(s.project_id == project_id && s.endpoint_id == endpoint_id));
        Ok(true)
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), WebhookError> {
        self.tables
            .write()
            .await
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, WebhookError> {
        let tables = self.tables.read().await;
        Ok(scoped(
            tables.subscriptions.get(&subscription_id),
            project_id,
            |s| s.project_id,
        ))
    }

    async fn list_subscriptions_for_source(
        &self,
        project_id: Uuid,
        source_id: Option<Uuid>,
    ) -> Result<Vec<Subscription>, WebhookError> {
        let tables = self.tables.read().await;
        let mut subscriptions: Vec<Subscription> = tables
            .subscriptions
            .values()
            .filter(|s| {
                s.project_id == project_id
                    && (s.source_id.is_none() || s.source_id == source_id)
            })
            .cloned()
            .collect();
        subscriptions.sort_by_key(|s| s.created_at);
        Ok(subscriptions)
    }

    async fn delete_subscription(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<bool, WebhookError> {
        let mut tables = self.tables.write().await;
        let owned = tables
            .subscriptions
            .get(&subscription_id)
            .is_some_and(|s| s.project_id == project_id);
        if owned {
            tables.subscriptions.remove(&subscription_id);
        }
        Ok(owned)
    }

    async fn insert_event(&self, event: &Event) -> Result<(), WebhookError> {
        self.tables
            .write()
            .await
            .events
            .insert(event.id, event.clone());
        Ok(())
    }

    async fn get_event(
        &self,
        project_id: Uuid,
        event_id: Uuid,
    ) -> Result<Option<Event>, WebhookError> {
        let tables = self.tables.read().await;
        Ok(scoped(tables.events.get(&event_id), project_id, |e| {
            e.project_id
        }))
    }

    async fn find_event_by_idempotency_key(
        &self,
        project_id: Uuid,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Event>, WebhookError> {
        let tables = self.tables.read().await;
        Ok(tables
            .events
            .values()
            .filter(|e| {
                e.project_id == project_id
                    && e.created_at >= since
                    && e.idempotency_key.as_deref() == Some(key)
            })
            .min_by_key(|e| e.created_at)
            .cloned())
    }

    async fn complete_event(
        &self,
        project_id: Uuid,
        event_id: Uuid,
        endpoint_ids: &[Uuid],
        status: EventStatus,
    ) -> Result<bool, WebhookError> {
        let mut tables = self.tables.write().await;
        match tables.events.get_mut(&event_id) {
            Some(event) if event.project_id == project_id && event.status == EventStatus::Pending => {
                event.endpoint_ids.extend_from_slice(endpoint_ids);
                event.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_delivery(&self, delivery: &EventDelivery) -> Result<(), WebhookError> {
        self.tables
            .write()
            .await
            .deliveries
            .insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn get_delivery(
        &self,
        project_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Option<EventDelivery>, WebhookError> {
        let tables = self.tables.read().await;
        Ok(scoped(tables.deliveries.get(&delivery_id), project_id, |d| {
            d.project_id
        }))
    }

    async fn update_delivery(&self, delivery: &EventDelivery) -> Result<(), WebhookError> {
        let mut tables = self.tables.write().await;
        match tables.deliveries.get_mut(&delivery.id) {
            Some(existing) if existing.project_id == delivery.project_id => {
                *existing = delivery.clone();
                Ok(())
            }
            _ => Err(WebhookError::EventDeliveryNotFound),
        }
    }

    async fn list_deliveries(
        &self,
        project_id: Uuid,
        filter: &DeliveryFilter,
    ) -> Result<Vec<EventDelivery>, WebhookError> {
        let tables = self.tables.read().await;
        let mut deliveries: Vec<EventDelivery> = tables
            .deliveries
            .values()
            .filter(|d| d.project_id == project_id && filter.matches(d))
            .cloned()
            .collect();
        deliveries.sort_by_key(|d| d.created_at);
        Ok(deliveries)
    }

    async fn discard_pending_deliveries(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<u64, WebhookError> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let mut discarded = 0;
        for delivery in tables.deliveries.values_mut() {
            if delivery.project_id == project_id
                && delivery.endpoint_id == endpoint_id
                && !delivery.status.is_terminal()
            {
                delivery.status = DeliveryStatus::Discarded;
                delivery.next_attempt_at = None;
                delivery.updated_at = now;
                discarded += 1;
            }
        }
        Ok(discarded)
    }

    async fn insert_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), WebhookError> {
        self.tables.write().await.attempts.push(attempt.clone());
        Ok(())
    }

    async fn list_attempts(
        &self,
        project_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Vec<DeliveryAttempt>, WebhookError> {
        let tables = self.tables.read().await;
        Ok(tables
            .attempts
            .iter()
            .filter(|a| a.project_id == project_id && a.delivery_id == delivery_id)
            .cloned()
            .collect())
    }
}
