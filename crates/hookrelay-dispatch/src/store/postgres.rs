//! PostgreSQL-backed store.
//!
//! Each record is kept as a JSONB document next to the columns the pipeline
//! filters on. Event payloads live in a separate `BYTEA` column so binary
//! bodies survive unchanged. Schema: `migrations/0001_init.sql`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::Store;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::WebhookError;
use crate::models::{
    DeliveryAttempt, DeliveryFilter, Endpoint, EndpointSecret, EndpointStatus, Event,
    EventDelivery, EventStatus, Project, Source, Subscription,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply pending migrations.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::Database` if the connection or a migration
    /// fails.
    pub async fn connect(database_url: &str) -> Result<Self, WebhookError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| WebhookError::Store(format!("Migration failed: {e}")))?;
        Ok(Self::new(pool))
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn document<T: DeserializeOwned>(row: &PgRow) -> Result<T, WebhookError> {
    let Json(value): Json<T> = row.try_get("data")?;
    Ok(value)
}

fn event_from_row(row: &PgRow) -> Result<Event, WebhookError> {
    let mut event: Event = document(row)?;
    event.payload = row.try_get("payload")?;
    Ok(event)
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl Store for PgStore {
    // -- projects ----------------------------------------------------------

    async fn insert_project(&self, project: &Project) -> Result<(), WebhookError> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, data, created_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(project.id)
        .bind(Json(project))
        .bind(project.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, WebhookError> {
        sqlx::query("SELECT data FROM projects WHERE id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(document)
            .transpose()
    }

    async fn update_project_breaker(
        &self,
        project_id: Uuid,
        config: &CircuitBreakerConfig,
    ) -> Result<(), WebhookError> {
        let result = sqlx::query(
            r#"
            UPDATE projects
            SET data = jsonb_set(data, '{breaker}', $2)
            WHERE id = $1
            "#,
        )
        .bind(project_id)
        .bind(Json(config))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WebhookError::ProjectNotFound);
        }
        Ok(())
    }

    // -- sources -----------------------------------------------------------

    async fn insert_source(&self, source: &Source) -> Result<(), WebhookError> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, project_id, mask_id, data, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(source.id)
        .bind(source.project_id)
        .bind(&source.mask_id)
        .bind(Json(source))
        .bind(source.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                WebhookError::invalid("mask_id", "already in use")
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn get_source_by_mask(&self, mask_id: &str) -> Result<Option<Source>, WebhookError> {
        sqlx::query("SELECT data FROM sources WHERE mask_id = $1")
            .bind(mask_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(document)
            .transpose()
    }

    async fn get_source(
        &self,
        project_id: Uuid,
        source_id: Uuid,
    ) -> Result<Option<Source>, WebhookError> {
        sqlx::query("SELECT data FROM sources WHERE id = $1 AND project_id = $2")
            .bind(source_id)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(document)
            .transpose()
    }

    // -- endpoints ---------------------------------------------------------

    async fn insert_endpoint(&self, endpoint: &Endpoint) -> Result<(), WebhookError> {
        sqlx::query(
            r#"
            INSERT INTO endpoints (id, project_id, data, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(endpoint.id)
        .bind(endpoint.project_id)
        .bind(Json(endpoint))
        .bind(endpoint.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_endpoint(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<Option<Endpoint>, WebhookError> {
        sqlx::query("SELECT data FROM endpoints WHERE id = $1 AND project_id = $2")
            .bind(endpoint_id)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(document)
            .transpose()
    }

    async fn list_endpoints(&self, project_id: Uuid) -> Result<Vec<Endpoint>, WebhookError> {
        sqlx::query("SELECT data FROM endpoints WHERE project_id = $1 ORDER BY created_at")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(document)
            .collect()
    }

    async fn update_endpoint_status(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
        status: EndpointStatus,
    ) -> Result<bool, WebhookError> {
        let result = sqlx::query(
            r#"
            UPDATE endpoints
            SET data = jsonb_set(data, '{status}', to_jsonb($3::text))
            WHERE id = $1 AND project_id = $2
            "#,
        )
        .bind(endpoint_id)
        .bind(project_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_endpoint_secrets(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
        secrets: &[EndpointSecret],
    ) -> Result<bool, WebhookError> {
        let result = sqlx::query(
            r#"
            UPDATE endpoints
            SET data = jsonb_set(data, '{secrets}', $3)
            WHERE id = $1 AND project_id = $2
            "#,
        )
        .bind(endpoint_id)
        .bind(project_id)
        .bind(Json(secrets))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_endpoint(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<bool, WebhookError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM subscriptions WHERE project_id = $1 AND endpoint_id = $2")
            .bind(project_id)
            .bind(endpoint_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM endpoints WHERE id = $1 AND project_id = $2")
            .bind(endpoint_id)
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    // -- subscriptions -----------------------------------------------------

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), WebhookError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, project_id, source_id, endpoint_id, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.project_id)
        .bind(subscription.source_id)
        .bind(subscription.endpoint_id)
        .bind(Json(subscription))
        .bind(subscription.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_subscription(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, WebhookError> {
        sqlx::query("SELECT data FROM subscriptions WHERE id = $1 AND project_id = $2")
            .bind(subscription_id)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(document)
            .transpose()
    }

    async fn list_subscriptions_for_source(
        &self,
        project_id: Uuid,
        source_id: Option<Uuid>,
    ) -> Result<Vec<Subscription>, WebhookError> {
        sqlx::query(
            r#"
            SELECT data FROM subscriptions
            WHERE project_id = $1 AND (source_id IS NULL OR source_id = $2)
            ORDER BY created_at
            "#,
        )
        .bind(project_id)
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(document)
        .collect()
    }

    async fn delete_subscription(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<bool, WebhookError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = $1 AND project_id = $2")
            .bind(subscription_id)
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- events ------------------------------------------------------------

    async fn insert_event(&self, event: &Event) -> Result<(), WebhookError> {
        let mut doc = event.clone();
        let payload = std::mem::take(&mut doc.payload);
        sqlx::query(
            r#"
            INSERT INTO events (id, project_id, idempotency_key, status, payload, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.project_id)
        .bind(&event.idempotency_key)
        .bind(event.status.as_str())
        .bind(payload)
        .bind(Json(&doc))
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_event(
        &self,
        project_id: Uuid,
        event_id: Uuid,
    ) -> Result<Option<Event>, WebhookError> {
        sqlx::query("SELECT data, payload FROM events WHERE id = $1 AND project_id = $2")
            .bind(event_id)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(event_from_row)
            .transpose()
    }

    async fn find_event_by_idempotency_key(
        &self,
        project_id: Uuid,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Event>, WebhookError> {
        sqlx::query(
            r#"
            SELECT data, payload FROM events
            WHERE project_id = $1 AND idempotency_key = $2 AND created_at >= $3
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(project_id)
        .bind(key)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(event_from_row)
        .transpose()
    }

    async fn complete_event(
        &self,
        project_id: Uuid,
        event_id: Uuid,
        endpoint_ids: &[Uuid],
        status: EventStatus,
    ) -> Result<bool, WebhookError> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = $4,
                data = jsonb_set(
                    jsonb_set(data, '{status}', to_jsonb($4::text)),
                    '{endpoint_ids}',
                    COALESCE(data->'endpoint_ids', '[]'::jsonb) || $3
                )
            WHERE id = $1 AND project_id = $2 AND status = 'pending'
            "#,
        )
        .bind(event_id)
        .bind(project_id)
        .bind(Json(endpoint_ids))
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- deliveries --------------------------------------------------------

    async fn insert_delivery(&self, delivery: &EventDelivery) -> Result<(), WebhookError> {
        sqlx::query(
            r#"
            INSERT INTO event_deliveries
                (id, project_id, event_id, endpoint_id, status, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.project_id)
        .bind(delivery.event_id)
        .bind(delivery.endpoint_id)
        .bind(delivery.status.as_str())
        .bind(Json(delivery))
        .bind(delivery.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_delivery(
        &self,
        project_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Option<EventDelivery>, WebhookError> {
        sqlx::query("SELECT data FROM event_deliveries WHERE id = $1 AND project_id = $2")
            .bind(delivery_id)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(document)
            .transpose()
    }

    async fn update_delivery(&self, delivery: &EventDelivery) -> Result<(), WebhookError> {
        let result = sqlx::query(
            r#"
            UPDATE event_deliveries
            SET status = $3, data = $4
            WHERE id = $1 AND project_id = $2
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.project_id)
        .bind(delivery.status.as_str())
        .bind(Json(delivery))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WebhookError::EventDeliveryNotFound);
        }
        Ok(())
    }

    async fn list_deliveries(
        &self,
        project_id: Uuid,
        filter: &DeliveryFilter,
    ) -> Result<Vec<EventDelivery>, WebhookError> {
        let statuses: Vec<String> = filter
            .status
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        sqlx::query(
            r#"
            SELECT data FROM event_deliveries
            WHERE project_id = $1
              AND ($2::uuid IS NULL OR endpoint_id = $2)
              AND ($3::uuid IS NULL OR event_id = $3)
              AND (cardinality($4::text[]) = 0 OR status = ANY($4))
              AND ($5::timestamptz IS NULL OR created_at >= $5)
              AND ($6::timestamptz IS NULL OR created_at < $6)
            ORDER BY created_at
            "#,
        )
        .bind(project_id)
        .bind(filter.endpoint_id)
        .bind(filter.event_id)
        .bind(statuses)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(document)
        .collect()
    }

    async fn discard_pending_deliveries(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<u64, WebhookError> {
        let result = sqlx::query(
            r#"
            UPDATE event_deliveries
            SET status = 'discarded',
                data = data || jsonb_build_object(
                    'status', 'discarded',
                    'next_attempt_at', 'null'::jsonb,
                    'updated_at', $3::jsonb
                )
            WHERE project_id = $1 AND endpoint_id = $2
              AND status IN ('scheduled', 'processing')
            "#,
        )
        .bind(project_id)
        .bind(endpoint_id)
        .bind(Json(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // -- attempts ----------------------------------------------------------

    async fn insert_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), WebhookError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_attempts (id, project_id, delivery_id, data, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.project_id)
        .bind(attempt.delivery_id)
        .bind(Json(attempt))
        .bind(attempt.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_attempts(
        &self,
        project_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Vec<DeliveryAttempt>, WebhookError> {
        sqlx::query(
            r#"
            SELECT data FROM delivery_attempts
            WHERE project_id = $1 AND delivery_id = $2
            ORDER BY seq
            "#,
        )
        .bind(project_id)
        .bind(delivery_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(document)
        .collect()
    }
}
