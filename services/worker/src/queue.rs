//! Durable, at-least-once job queues
//!
//! A [`Queue`] is a named producer/consumer pair over a [`QueueBackend`].
//! Reserving a job moves it to an in-flight set; it leaves that set only
//! when the handler succeeds (ack), when it is re-queued for another
//! attempt, or when it is dead-lettered. Retry and backoff are generic:
//! handlers only decide whether a single delivery succeeded. A retried job
//! is held back until its backoff elapses while later jobs keep flowing.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::error::CacheError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::jobs::JobError;

pub use memory::MemoryQueue;
pub use redis::RedisQueue;

/// Queue consumed by the thumbnail worker
pub const THUMBNAIL_QUEUE: &str = "fileQueue";

/// Queue consumed by the welcome worker
pub const WELCOME_QUEUE: &str = "userQueue";

/// Errors raised by queue plumbing, never by job handlers
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Cache(#[from] CacheError),

    #[error("Job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue {0} already has a consumer")]
    ConsumerAlreadyRegistered(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A job as stored in a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: Uuid,
    pub queue: String,
    pub data: serde_json::Value,
    /// Deliveries that already failed
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may be reserved
    #[serde(default = "Utc::now")]
    pub available_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(queue: impl Into<String>, data: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            data,
            attempts: 0,
            enqueued_at: now,
            available_at: now,
        }
    }

    /// The next delivery of this job, held back for `delay`
    pub fn retried(&self, delay: Duration) -> Self {
        let available_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            attempts: self.attempts + 1,
            available_at,
            ..self.clone()
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.available_at <= now
    }
}

/// A job taken off a queue, pending ack, retry or dead-lettering
#[derive(Debug, Clone)]
pub struct Reservation {
    pub envelope: JobEnvelope,
    /// Backend handle identifying the in-flight entry
    pub(crate) receipt: String,
}

/// A job that exhausted its attempts or could not be decoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub envelope: JobEnvelope,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Storage behind one or more named queues
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn push(&self, envelope: &JobEnvelope) -> QueueResult<()>;

    /// Take the oldest pending job, waiting up to `wait` for one to arrive
    async fn reserve(&self, queue: &str, wait: Duration) -> QueueResult<Option<Reservation>>;

    async fn ack(&self, reservation: &Reservation) -> QueueResult<()>;

    /// Put a reserved job back with its attempt count bumped, reservable
    /// again once `delay` has passed
    async fn retry(&self, reservation: &Reservation, delay: Duration) -> QueueResult<()>;

    async fn dead_letter(&self, reservation: &Reservation, reason: &str) -> QueueResult<()>;

    /// Jobs waiting for delivery, including those still backing off
    async fn pending_len(&self, queue: &str) -> QueueResult<u64>;
}

/// How often, and how patiently, a failed delivery is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total deliveries before a job is dead-lettered
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before re-queueing after failed delivery number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

/// Handles one decoded job per delivery
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Job: DeserializeOwned + Send + 'static;

    async fn handle(&self, job: Self::Job) -> Result<(), JobError>;
}

/// A named queue over a shared backend
pub struct Queue {
    name: String,
    backend: Arc<dyn QueueBackend>,
    has_consumer: AtomicBool,
}

impl Queue {
    pub fn new(name: impl Into<String>, backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            has_consumer: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a job, returning its ID
    pub async fn enqueue<T: Serialize + ?Sized>(&self, data: &T) -> QueueResult<Uuid> {
        let envelope = JobEnvelope::new(&self.name, serde_json::to_value(data)?);
        self.backend.push(&envelope).await?;
        debug!("Enqueued job {} on {}", envelope.id, self.name);
        Ok(envelope.id)
    }

    pub async fn pending(&self) -> QueueResult<u64> {
        self.backend.pending_len(&self.name).await
    }

    /// Attach the queue's single consumer
    pub fn register_consumer<H: JobHandler>(
        &self,
        handler: H,
        policy: RetryPolicy,
    ) -> QueueResult<Consumer<H>> {
        if self.has_consumer.swap(true, Ordering::SeqCst) {
            return Err(QueueError::ConsumerAlreadyRegistered(self.name.clone()));
        }

        Ok(Consumer {
            queue: self.name.clone(),
            backend: self.backend.clone(),
            handler: Arc::new(handler),
            policy,
            poll_interval: Duration::from_secs(5),
        })
    }
}

/// What happened to one reserved job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Nothing arrived within the wait
    Idle,
    Completed {
        job_id: Uuid,
    },
    Retried {
        job_id: Uuid,
        attempt: u32,
        delay: Duration,
    },
    DeadLettered {
        job_id: Uuid,
        reason: String,
    },
}

/// Pulls jobs from one queue and feeds them to its handler
pub struct Consumer<H: JobHandler> {
    queue: String,
    backend: Arc<dyn QueueBackend>,
    handler: Arc<H>,
    policy: RetryPolicy,
    poll_interval: Duration,
}

impl<H: JobHandler> Consumer<H> {
    /// How long one reserve call waits before checking for shutdown
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Reserve and handle at most one job
    pub async fn process_next(&self, wait: Duration) -> QueueResult<Delivery> {
        let Some(reservation) = self.backend.reserve(&self.queue, wait).await? else {
            return Ok(Delivery::Idle);
        };

        let job_id = reservation.envelope.id;
        let attempt = reservation.envelope.attempts + 1;

        let job: H::Job = match serde_json::from_value(reservation.envelope.data.clone()) {
            Ok(job) => job,
            Err(e) => {
                let reason = format!("Malformed job payload: {}", e);
                error!("Dead-lettering job {} on {}: {}", job_id, self.queue, reason);
                self.backend.dead_letter(&reservation, &reason).await?;
                return Ok(Delivery::DeadLettered { job_id, reason });
            }
        };

        match self.handler.handle(job).await {
            Ok(()) => {
                self.backend.ack(&reservation).await?;
                info!("Job {} on {} completed", job_id, self.queue);
                Ok(Delivery::Completed { job_id })
            }
            Err(e) if attempt >= self.policy.max_attempts => {
                let reason = e.to_string();
                error!(
                    "Job {} on {} failed after {} attempts: {}",
                    job_id, self.queue, attempt, reason
                );
                self.backend.dead_letter(&reservation, &reason).await?;
                Ok(Delivery::DeadLettered { job_id, reason })
            }
            Err(e) => {
                let delay = self.policy.backoff(attempt);
                warn!(
                    "Job {} on {} failed (attempt {}/{}): {}; retrying in {:?}",
                    job_id, self.queue, attempt, self.policy.max_attempts, e, delay
                );
                self.backend.retry(&reservation, delay).await?;
                Ok(Delivery::Retried {
                    job_id,
                    attempt,
                    delay,
                })
            }
        }
    }

    /// Process jobs until `shutdown` turns true or its sender goes away
    ///
    /// A job already being handled is finished before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Consumer started for queue {}", self.queue);

        loop {
            match shutdown.has_changed() {
                Ok(_) if *shutdown.borrow_and_update() => break,
                Ok(_) => {}
                Err(_) => break,
            }

            match self.process_next(self.poll_interval).await {
                Ok(Delivery::Idle) => debug!("No job on {}", self.queue),
                Ok(_) => {}
                Err(e) => {
                    error!("Queue {} unavailable: {}", self.queue, e);
                    tokio::select! {
                        _ = sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!("Consumer stopped for queue {}", self.queue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy {
            max_attempts: 100,
            base_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(64), Duration::from_secs(u64::from(u32::MAX)));

        let policy = RetryPolicy {
            max_attempts: 100,
            base_delay: Duration::MAX,
        };
        assert_eq!(policy.backoff(2), Duration::MAX);
    }

    #[test]
    fn test_retried_envelope_is_held_back() {
        let envelope = JobEnvelope::new(THUMBNAIL_QUEUE, serde_json::json!({}));
        assert!(envelope.is_due(Utc::now()));

        let retried = envelope.retried(Duration::from_secs(60));
        assert_eq!(retried.id, envelope.id);
        assert_eq!(retried.attempts, 1);
        assert!(!retried.is_due(Utc::now()));
        assert!(retried.is_due(Utc::now() + chrono::Duration::seconds(61)));

        let forever = envelope.retried(Duration::MAX);
        assert_eq!(forever.available_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_envelope_without_availability_is_due() {
        let raw = serde_json::json!({
            "id": Uuid::new_v4(),
            "queue": WELCOME_QUEUE,
            "data": {},
            "attempts": 0,
            "enqueued_at": Utc::now(),
        });
        let envelope: JobEnvelope = serde_json::from_value(raw).unwrap();
        assert!(envelope.is_due(Utc::now()));
    }

    struct UnavailableBackend;

    fn unavailable() -> QueueError {
        QueueError::Serialization(serde_json::from_str::<u32>("down").unwrap_err())
    }

    #[async_trait]
    impl QueueBackend for UnavailableBackend {
        async fn push(&self, _: &JobEnvelope) -> QueueResult<()> {
            Err(unavailable())
        }

        async fn reserve(&self, _: &str, _: Duration) -> QueueResult<Option<Reservation>> {
            Err(unavailable())
        }

        async fn ack(&self, _: &Reservation) -> QueueResult<()> {
            Err(unavailable())
        }

        async fn retry(&self, _: &Reservation, _: Duration) -> QueueResult<()> {
            Err(unavailable())
        }

        async fn dead_letter(&self, _: &Reservation, _: &str) -> QueueResult<()> {
            Err(unavailable())
        }

        async fn pending_len(&self, _: &str) -> QueueResult<u64> {
            Err(unavailable())
        }
    }

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        type Job = serde_json::Value;

        async fn handle(&self, _: Self::Job) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_wait_after_backend_error() {
        let queue = Queue::new(THUMBNAIL_QUEUE, Arc::new(UnavailableBackend));
        let consumer = queue
            .register_consumer(NoopHandler, RetryPolicy::default())
            .unwrap()
            .with_poll_interval(Duration::from_secs(3600));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(consumer.run(shutdown_rx));

        sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("consumer should stop without waiting out the poll interval")
            .unwrap();
    }

    #[test]
    fn test_envelope_round_trips_as_json() {
        let envelope = JobEnvelope::new(THUMBNAIL_QUEUE, serde_json::json!({ "userId": "u" }));
        let raw = serde_json::to_string(&envelope).unwrap();
        let decoded: JobEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded, envelope);
    }
}
