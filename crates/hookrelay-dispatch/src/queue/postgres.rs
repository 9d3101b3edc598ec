//! Job queue on a PostgreSQL table.
//!
//! Leasing uses `FOR UPDATE SKIP LOCKED` so any number of worker processes
//! can poll the same table. A leased row carries `leased_until`; once that
//! passes, the row is eligible again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{Job, JobQueue, Lease};
use crate::error::WebhookError;

#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
    lease_duration: chrono::Duration,
}

impl PgQueue {
    #[must_use]
    pub fn new(pool: PgPool, lease_duration: std::time::Duration) -> Self {
        Self {
            pool,
            lease_duration: chrono::Duration::from_std(lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }
}

#[async_trait]
impl JobQueue for PgQueue {
    async fn enqueue(&self, job: Job, run_at: Option<DateTime<Utc>>) -> Result<(), WebhookError> {
        sqlx::query(
            r#"
            INSERT INTO queue_jobs (id, queue, payload, run_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job.queue_name())
        .bind(Json(&job))
        .bind(run_at.unwrap_or_else(Utc::now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Lease>, WebhookError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET leased_until = $3, delivery_count = delivery_count + 1
            WHERE id = (
                SELECT id FROM queue_jobs
                WHERE queue = $1
                  AND run_at <= $2
                  AND (leased_until IS NULL OR leased_until <= $2)
                ORDER BY run_at, seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, delivery_count
            "#,
        )
        .bind(queue)
        .bind(now)
        .bind(now + self.lease_duration)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let Json(job): Json<Job> = row.try_get("payload")?;
        let delivery_count: i32 = row.try_get("delivery_count")?;
        Ok(Some(Lease {
            id: row.try_get("id")?,
            queue: queue.to_string(),
            job,
            delivery_count: u32::try_from(delivery_count).unwrap_or(u32::MAX),
        }))
    }

    async fn ack(&self, lease: &Lease) -> Result<(), WebhookError> {
        // A row re-leased after expiry belongs to another worker now.
        sqlx::query("DELETE FROM queue_jobs WHERE id = $1 AND delivery_count = $2")
            .bind(lease.id)
            .bind(i32::try_from(lease.delivery_count).unwrap_or(i32::MAX))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(
        &self,
        lease: &Lease,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), WebhookError> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET leased_until = NULL, run_at = $3
            WHERE id = $1 AND delivery_count = $2
            "#,
        )
        .bind(lease.id)
        .bind(i32::try_from(lease.delivery_count).unwrap_or(i32::MAX))
        .bind(retry_at.unwrap_or_else(Utc::now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn len(&self, queue: &str) -> Result<usize, WebhookError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM queue_jobs WHERE queue = $1")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
