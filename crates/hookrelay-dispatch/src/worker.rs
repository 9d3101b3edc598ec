//! Queue workers.
//!
//! A [`WorkerPool`] runs a fixed number of workers per named queue. Each
//! worker leases one job at a time, hands it to a [`JobHandler`] and acks or
//! nacks the lease depending on the result. Jobs leased by a worker that dies
//! become visible again once their lease expires.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::WebhookError;
use crate::queue::{Job, JobQueue, Lease, CREATE_EVENT_QUEUE, EVENT_DELIVERY_QUEUE};
use crate::services::{DeliveryService, EventProcessor};

/// Upper bound on the redelivery delay after transient failures.
const MAX_REDELIVERY_BACKOFF_SECS: u64 = 60;

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), WebhookError>;
}

/// Routes event jobs to matching and delivery jobs to dispatch.
pub struct PipelineHandler {
    processor: Arc<EventProcessor>,
    delivery: Arc<DeliveryService>,
}

impl PipelineHandler {
    pub fn new(processor: Arc<EventProcessor>, delivery: Arc<DeliveryService>) -> Self {
        Self {
            processor,
            delivery,
        }
    }
}

#[async_trait]
impl JobHandler for PipelineHandler {
    async fn handle(&self, job: &Job) -> Result<(), WebhookError> {
        match job {
            Job::CreateEvent {
                event_id,
                project_id,
            } => match self.processor.process_event(*project_id, *event_id).await {
                Ok(_) => Ok(()),
                // A redelivered job for an event that already finished matching.
                Err(WebhookError::EventAlreadyProcessed) => {
                    debug!(target: "worker", event_id = %event_id, "Event already processed");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Job::DispatchDelivery(dispatch) => {
                let outcome = self.delivery.process(dispatch).await?;
                debug!(
                    target: "worker",
                    delivery_id = %dispatch.delivery_id,
                    outcome = ?outcome,
                    "Dispatch job finished"
                );
                Ok(())
            }
        }
    }
}

/// Lease and run one due job from `queue_name`. Returns false when nothing
/// was due.
///
/// A handler panic is caught and the job handed back to the queue, so the
/// calling worker keeps running.
pub async fn run_once(
    queue: &dyn JobQueue,
    handler: &dyn JobHandler,
    queue_name: &str,
) -> Result<bool, WebhookError> {
    let Some(lease) = queue.dequeue(queue_name).await? else {
        return Ok(false);
    };
    let result = match AssertUnwindSafe(handler.handle(&lease.job))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => Err(WebhookError::HandlerPanicked(panic_message(payload.as_ref()))),
    };
    settle(queue, &lease, result).await?;
    Ok(true)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn settle(
    queue: &dyn JobQueue,
    lease: &Lease,
    result: Result<(), WebhookError>,
) -> Result<(), WebhookError> {
    match result {
        Ok(()) => queue.ack(lease).await,
        Err(e) if e.is_transient() => {
            let backoff = 2u64
                .saturating_pow(lease.delivery_count)
                .min(MAX_REDELIVERY_BACKOFF_SECS);
            warn!(
                target: "worker",
                lease_id = %lease.id,
                queue = %lease.queue,
                delivery_count = lease.delivery_count,
                backoff_secs = backoff,
                error = %e,
                "Job failed transiently, handing back to queue"
            );
            let retry_at = Utc::now() + chrono::Duration::seconds(backoff as i64);
            queue.nack(lease, Some(retry_at)).await
        }
        Err(e) => {
            error!(
                target: "worker",
                lease_id = %lease.id,
                queue = %lease.queue,
                error = %e,
                "Job failed permanently, dropping"
            );
            queue.ack(lease).await
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Workers per queue.
    pub workers_per_queue: usize,
    /// Idle sleep between polls of an empty queue.
    pub poll_interval: Duration,
    pub queues: Vec<String>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers_per_queue: 4,
            poll_interval: Duration::from_millis(100),
            queues: vec![
                CREATE_EVENT_QUEUE.to_string(),
                EVENT_DELIVERY_QUEUE.to_string(),
            ],
        }
    }
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// Spawn the workers. They run until [`WorkerHandle::shutdown`].
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        info!(
            target: "worker",
            workers_per_queue = self.config.workers_per_queue,
            queues = ?self.config.queues,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting worker pool"
        );

        for queue_name in &self.config.queues {
            for worker_id in 0..self.config.workers_per_queue {
                tasks.push(tokio::spawn(worker_loop(
                    worker_id,
                    queue_name.clone(),
                    self.queue.clone(),
                    self.handler.clone(),
                    self.config.poll_interval,
                    shutdown_rx.clone(),
                )));
            }
        }

        WorkerHandle { shutdown_tx, tasks }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue_name: String,
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(target: "worker", worker_id, queue = %queue_name, "Worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let idle = match run_once(queue.as_ref(), handler.as_ref(), &queue_name).await {
            Ok(ran) => !ran,
            Err(e) => {
                error!(
                    target: "worker",
                    worker_id,
                    queue = %queue_name,
                    error = %e,
                    "Queue operation failed"
                );
                true
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
    debug!(target: "worker", worker_id, queue = %queue_name, "Worker stopped");
}

/// Running pool. Dropping it without [`shutdown`](Self::shutdown) leaves the
/// workers running until the runtime stops.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal every worker and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        info!(target: "worker", "Worker pool shutdown requested");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(target: "worker", error = %e, "Worker task panicked");
            }
        }
        info!(target: "worker", "Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct CountingHandler {
        calls: AtomicUsize,
        fail_with: Option<fn() -> WebhookError>,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &Job) -> Result<(), WebhookError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    fn create_event() -> Job {
        Job::CreateEvent {
            event_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_run_once_acks_success() {
        let queue = MemoryQueue::default();
        let handler = CountingHandler {
            calls: AtomicUsize::new(0),
            fail_with: None,
        };
        queue.enqueue(create_event(), None).await.unwrap();

        assert!(run_once(&queue, &handler, CREATE_EVENT_QUEUE).await.unwrap());
        assert!(!run_once(&queue, &handler, CREATE_EVENT_QUEUE).await.unwrap());
        assert_eq!(queue.len(CREATE_EVENT_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_nacked() {
        let queue = MemoryQueue::default();
        let handler = CountingHandler {
            calls: AtomicUsize::new(0),
            fail_with: Some(|| WebhookError::Store("connection reset".to_string())),
        };
        queue.enqueue(create_event(), None).await.unwrap();

        assert!(run_once(&queue, &handler, CREATE_EVENT_QUEUE).await.unwrap());
        // Handed back with a backoff, so still queued but not yet due.
        assert_eq!(queue.len(CREATE_EVENT_QUEUE).await.unwrap(), 1);
        assert!(!run_once(&queue, &handler, CREATE_EVENT_QUEUE).await.unwrap());
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn handle(&self, job: &Job) -> Result<(), WebhookError> {
            match job {
                Job::CreateEvent { .. } => panic!("token expiry overflowed"),
                Job::DispatchDelivery(_) => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_handler_panic_is_nacked_and_worker_survives() {
        let queue = MemoryQueue::default();
        queue.enqueue(create_event(), None).await.unwrap();

        assert!(run_once(&queue, &PanickingHandler, CREATE_EVENT_QUEUE).await.unwrap());
        // Handed back with a backoff rather than lost.
        assert_eq!(queue.len(CREATE_EVENT_QUEUE).await.unwrap(), 1);
        assert!(!run_once(&queue, &PanickingHandler, CREATE_EVENT_QUEUE).await.unwrap());
    }

    /// Panics on its first call only.
    struct PanicOnceHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for PanicOnceHandler {
        async fn handle(&self, _job: &Job) -> Result<(), WebhookError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first job blew up");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pool_keeps_running_after_handler_panic() {
        let queue: Arc<MemoryQueue> = Arc::new(MemoryQueue::default());
        let handler = Arc::new(PanicOnceHandler {
            calls: AtomicUsize::new(0),
        });
        queue.enqueue(create_event(), None).await.unwrap();
        queue.enqueue(create_event(), None).await.unwrap();

        let handle = WorkerPool::new(
            queue.clone(),
            handler.clone(),
            WorkerPoolConfig {
                workers_per_queue: 1,
                poll_interval: Duration::from_millis(10),
                queues: vec![CREATE_EVENT_QUEUE.to_string()],
            },
        )
        .start();

        for _ in 0..100 {
            if handler.calls.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        // The only worker went on to the second job after the panic.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        // The panicked job is back in the queue behind its backoff.
        assert_eq!(queue.len(CREATE_EVENT_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_dropped() {
        let queue = MemoryQueue::default();
        let handler = CountingHandler {
            calls: AtomicUsize::new(0),
            fail_with: Some(|| WebhookError::EventNotFound),
        };
        queue.enqueue(create_event(), None).await.unwrap();

        assert!(run_once(&queue, &handler, CREATE_EVENT_QUEUE).await.unwrap());
        assert_eq!(queue.len(CREATE_EVENT_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pool_drains_and_shuts_down() {
        let queue: Arc<MemoryQueue> = Arc::new(MemoryQueue::default());
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_with: None,
        });
        for _ in 0..5 {
            queue.enqueue(create_event(), None).await.unwrap();
        }

        let handle = WorkerPool::new(
            queue.clone(),
            handler.clone(),
            WorkerPoolConfig {
                workers_per_queue: 2,
                poll_interval: Duration::from_millis(10),
                queues: vec![CREATE_EVENT_QUEUE.to_string()],
            },
        )
        .start();

        for _ in 0..100 {
            if queue.len(CREATE_EVENT_QUEUE).await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
        assert_eq!(queue.len(CREATE_EVENT_QUEUE).await.unwrap(), 0);
    }
}
