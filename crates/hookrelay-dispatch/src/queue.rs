//! Durable job queue abstraction with lease/ack semantics.
//!
//! A dequeued job is leased, not removed. If the worker neither acks nor
//! nacks before the lease runs out (crash, hang), the job becomes visible
//! again. Delivery is at-least-once.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::WebhookError;

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "postgres")]
pub use postgres::PgQueue;

/// Queue consumed by the event-processing worker.
pub const CREATE_EVENT_QUEUE: &str = "create_event";

/// Queue consumed by the dispatch worker.
pub const EVENT_DELIVERY_QUEUE: &str = "event_delivery";

/// One delivery attempt to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub delivery_id: Uuid,
    pub event_id: Uuid,
    pub endpoint_id: Uuid,
    pub subscription_id: Uuid,
    pub project_id: Uuid,
    /// Attempts already made when the job was enqueued.
    pub attempt: u32,
    /// Skip the breaker admission check.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    CreateEvent { event_id: Uuid, project_id: Uuid },
    DispatchDelivery(DispatchJob),
}

impl Job {
    /// Queue the job belongs on.
    #[must_use]
    pub fn queue_name(&self) -> &'static str {
        match self {
            Self::CreateEvent { .. } => CREATE_EVENT_QUEUE,
            Self::DispatchDelivery(_) => EVENT_DELIVERY_QUEUE,
        }
    }
}

/// A job handed to a worker.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: Uuid,
    pub queue: String,
    pub job: Job,
    /// 1 on first delivery, higher after lease expiry or nack.
    pub delivery_count: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Make `job` visible at `run_at` (now when `None`).
    async fn enqueue(&self, job: Job, run_at: Option<DateTime<Utc>>) -> Result<(), WebhookError>;

    /// Lease the next due job of `queue`, if any.
    async fn dequeue(&self, queue: &str) -> Result<Option<Lease>, WebhookError>;

    /// Remove a finished job.
    async fn ack(&self, lease: &Lease) -> Result<(), WebhookError>;

    /// Hand a job back for redelivery at `retry_at` (now when `None`).
    async fn nack(&self, lease: &Lease, retry_at: Option<DateTime<Utc>>)
        -> Result<(), WebhookError>;

    /// Jobs waiting or leased on `queue`.
    async fn len(&self, queue: &str) -> Result<usize, WebhookError>;
}

#[derive(Debug)]
struct Scheduled {
    run_at: DateTime<Utc>,
    seq: u64,
    job: Job,
    delivery_count: u32,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed: BinaryHeap is a max-heap, the earliest job must come out first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct Leased {
    queue: String,
    job: Job,
    delivery_count: u32,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    ready: HashMap<String, BinaryHeap<Scheduled>>,
    leased: HashMap<Uuid, Leased>,
    seq: u64,
}

impl Inner {
    fn push(&mut self, queue: &str, job: Job, run_at: DateTime<Utc>, delivery_count: u32) {
        self.seq += 1;
        let seq = self.seq;
        self.ready.entry(queue.to_string()).or_default().push(Scheduled {
            run_at,
            seq,
            job,
            delivery_count,
        });
    }

    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(lease) = self.leased.remove(&id) {
                tracing::warn!(
                    target: "worker",
                    queue = %lease.queue,
                    lease_id = %id,
                    "Lease expired, job visible again"
                );
                self.push(&lease.queue, lease.job, now, lease.delivery_count);
            }
        }
    }
}

/// In-process queue with delayed jobs and lease expiry.
#[derive(Debug)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    lease_duration: chrono::Duration,
}

impl MemoryQueue {
    #[must_use]
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            lease_duration: chrono::Duration::from_std(lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }

    /// Make every delayed job of `queue` due now. Released jobs run in
    /// enqueue order. Returns how many jobs were waiting.
    pub async fn release_delayed(&self, queue: &str) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let Some(heap) = inner.ready.remove(queue) else {
            return 0;
        };
        let count = heap.len();
        let released: BinaryHeap<Scheduled> = heap
            .into_iter()
            .map(|mut scheduled| {
                scheduled.run_at = scheduled.run_at.min(now);
                scheduled
            })
            .collect();
        inner.ready.insert(queue.to_string(), released);
        count
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: Job, run_at: Option<DateTime<Utc>>) -> Result<(), WebhookError> {
        let queue = job.queue_name();
        let mut inner = self.inner.lock().await;
        inner.push(queue, job, run_at.unwrap_or_else(Utc::now), 0);
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Lease>, WebhookError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.reclaim_expired(now);

        let Some(heap) = inner.ready.get_mut(queue) else {
            return Ok(None);
        };
        if heap.peek().map_or(true, |next| next.run_at > now) {
            return Ok(None);
        }
        let Some(next) = heap.pop() else {
            return Ok(None);
        };

        let lease = Lease {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            job: next.job.clone(),
            delivery_count: next.delivery_count + 1,
        };
        inner.leased.insert(
            lease.id,
            Leased {
                queue: queue.to_string(),
                job: next.job,
                delivery_count: lease.delivery_count,
                expires_at: now + self.lease_duration,
            },
        );
        Ok(Some(lease))
    }

    async fn ack(&self, lease: &Lease) -> Result<(), WebhookError> {
        self.inner.lock().await.leased.remove(&lease.id);
        Ok(())
    }

    async fn nack(
        &self,
        lease: &Lease,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), WebhookError> {
        let mut inner = self.inner.lock().await;
        if let Some(leased) = inner.leased.remove(&lease.id) {
            inner.push(
                &leased.queue,
                leased.job,
                retry_at.unwrap_or_else(Utc::now),
                leased.delivery_count,
            );
        }
        Ok(())
    }

    async fn len(&self, queue: &str) -> Result<usize, WebhookError> {
        let inner = self.inner.lock().await;
        let ready = inner.ready.get(queue).map_or(0, BinaryHeap::len);
        let leased = inner.leased.values().filter(|l| l.queue == queue).count();
        Ok(ready + leased)
    }
}
