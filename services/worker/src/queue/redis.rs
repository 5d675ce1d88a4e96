//! Redis list-backed queue storage
//!
//! Each queue uses three lists: `queue:<name>:pending`,
//! `queue:<name>:processing` and `queue:<name>:dead`. Producers push on the
//! head of `pending`; consumers atomically move its tail onto `processing`,
//! so a consumer that dies mid-job leaves the job in `processing` for
//! [`RedisQueue::recover`] to hand back.
//!
//! Retried jobs wait in the sorted set `queue:<name>:delayed`, scored by the
//! millisecond timestamp they become available at, and are promoted onto
//! `pending` by whichever consumer reserves after that time.

use async_trait::async_trait;
use chrono::Utc;
use common::cache::RedisPool;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::{DeadLetter, JobEnvelope, QueueBackend, QueueResult, Reservation};

// Redis reads a zero BLMOVE timeout as "block forever".
const MIN_BLOCKING_WAIT: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct RedisQueue {
    pool: RedisPool,
}

impl RedisQueue {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn pending_key(queue: &str) -> String {
        format!("queue:{}:pending", queue)
    }

    fn processing_key(queue: &str) -> String {
        format!("queue:{}:processing", queue)
    }

    fn dead_key(queue: &str) -> String {
        format!("queue:{}:dead", queue)
    }

    fn delayed_key(queue: &str) -> String {
        format!("queue:{}:delayed", queue)
    }

    /// Move delayed jobs whose backoff has elapsed onto the pending list
    async fn promote_due(&self, queue: &str) -> QueueResult<()> {
        let delayed = Self::delayed_key(queue);
        for raw in self
            .pool
            .due(&delayed, Utc::now().timestamp_millis())
            .await?
        {
            // Another consumer may have promoted it first
            if self.pool.unschedule(&delayed, &raw).await? {
                self.pool.push_front(&Self::pending_key(queue), &raw).await?;
                debug!("Promoted delayed job on {}", queue);
            }
        }
        Ok(())
    }

    /// Time until the earliest delayed job becomes available
    async fn until_next_due(&self, queue: &str) -> QueueResult<Option<Duration>> {
        let next = self.pool.next_score(&Self::delayed_key(queue)).await?;
        Ok(next.map(|due| {
            let millis = due.saturating_sub(Utc::now().timestamp_millis());
            Duration::from_millis(u64::try_from(millis).unwrap_or(0))
        }))
    }

    /// Return jobs left in flight by a previous consumer to the pending list
    pub async fn recover(&self, queue: &str) -> QueueResult<u64> {
        let moved = self
            .pool
            .move_all(&Self::processing_key(queue), &Self::pending_key(queue))
            .await?;
        if moved > 0 {
            info!("Recovered {} in-flight jobs on {}", moved, queue);
        }
        Ok(moved)
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn push(&self, envelope: &JobEnvelope) -> QueueResult<()> {
        let raw = serde_json::to_string(envelope)?;
        self.pool
            .push_front(&Self::pending_key(&envelope.queue), &raw)
            .await?;
        Ok(())
    }

    async fn reserve(&self, queue: &str, wait: Duration) -> QueueResult<Option<Reservation>> {
        let processing = Self::processing_key(queue);
        let deadline = Instant::now() + wait;

        let raw = loop {
            self.promote_due(queue).await?;

            let mut block = deadline.saturating_duration_since(Instant::now());
            if let Some(until_due) = self.until_next_due(queue).await? {
                block = block.min(until_due);
            }

            let moved = self
                .pool
                .move_blocking(
                    &Self::pending_key(queue),
                    &processing,
                    block.max(MIN_BLOCKING_WAIT),
                )
                .await?;
            match moved {
                Some(raw) => break raw,
                None if Instant::now() >= deadline => return Ok(None),
                None => {}
            }
        };

        match serde_json::from_str::<JobEnvelope>(&raw) {
            Ok(envelope) => Ok(Some(Reservation {
                envelope,
                receipt: raw,
            })),
            Err(e) => {
                error!("Unreadable job on {}, moving it to the dead list: {}", queue, e);
                self.pool.push_front(&Self::dead_key(queue), &raw).await?;
                self.pool.remove(&processing, &raw).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, reservation: &Reservation) -> QueueResult<()> {
        self.pool
            .remove(
                &Self::processing_key(&reservation.envelope.queue),
                &reservation.receipt,
            )
            .await?;
        Ok(())
    }

    async fn retry(&self, reservation: &Reservation, delay: Duration) -> QueueResult<()> {
        let envelope = reservation.envelope.retried(delay);
        let raw = serde_json::to_string(&envelope)?;

        // Schedule before removing: a crash in between duplicates the job rather than losing it
        self.pool
            .schedule(
                &Self::delayed_key(&envelope.queue),
                &raw,
                envelope.available_at.timestamp_millis(),
            )
            .await?;
        self.ack(reservation).await
    }

    async fn dead_letter(&self, reservation: &Reservation, reason: &str) -> QueueResult<()> {
        let letter = DeadLetter {
            envelope: reservation.envelope.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        };
        let raw = serde_json::to_string(&letter)?;
        self.pool
            .push_front(&Self::dead_key(&reservation.envelope.queue), &raw)
            .await?;
        self.ack(reservation).await
    }

    async fn pending_len(&self, queue: &str) -> QueueResult<u64> {
        let pending = self.pool.list_len(&Self::pending_key(queue)).await?;
        let delayed = self.pool.sorted_len(&Self::delayed_key(queue)).await?;
        Ok(pending + delayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::cache::RedisConfig;

    #[test]
    fn test_list_keys() {
        assert_eq!(RedisQueue::pending_key("fileQueue"), "queue:fileQueue:pending");
        assert_eq!(
            RedisQueue::processing_key("fileQueue"),
            "queue:fileQueue:processing"
        );
        assert_eq!(RedisQueue::dead_key("userQueue"), "queue:userQueue:dead");
        assert_eq!(
            RedisQueue::delayed_key("userQueue"),
            "queue:userQueue:delayed"
        );
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_redis_reserve_ack_and_recover() -> anyhow::Result<()> {
        let pool = RedisPool::new(&RedisConfig::from_env()?).await?;
        let queue = RedisQueue::new(pool);
        let name = format!("test-{}", uuid::Uuid::new_v4());

        let envelope = JobEnvelope::new(&name, serde_json::json!({ "userId": "u" }));
        queue.push(&envelope).await?;
        assert_eq!(queue.pending_len(&name).await?, 1);

        let reservation = queue
            .reserve(&name, Duration::from_secs(1))
            .await?
            .expect("job should be reserved");
        assert_eq!(reservation.envelope, envelope);
        assert_eq!(queue.pending_len(&name).await?, 0);

        // Simulate a crashed consumer
        assert_eq!(queue.recover(&name).await?, 1);
        let reservation = queue
            .reserve(&name, Duration::from_secs(1))
            .await?
            .expect("recovered job should be reserved");
        queue.ack(&reservation).await?;
        assert_eq!(queue.recover(&name).await?, 0);
        assert!(queue.reserve(&name, Duration::from_millis(50)).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_redis_retry_waits_out_backoff() -> anyhow::Result<()> {
        let pool = RedisPool::new(&RedisConfig::from_env()?).await?;
        let queue = RedisQueue::new(pool);
        let name = format!("test-{}", uuid::Uuid::new_v4());

        let failing = JobEnvelope::new(&name, serde_json::json!({ "n": 1 }));
        let next = JobEnvelope::new(&name, serde_json::json!({ "n": 2 }));
        queue.push(&failing).await?;
        queue.push(&next).await?;

        let reservation = queue
            .reserve(&name, Duration::from_secs(1))
            .await?
            .expect("job should be reserved");
        assert_eq!(reservation.envelope.id, failing.id);
        queue
            .retry(&reservation, Duration::from_millis(300))
            .await?;
        assert_eq!(queue.pending_len(&name).await?, 2);

        let reservation = queue
            .reserve(&name, Duration::from_secs(1))
            .await?
            .expect("later job should not wait for the backoff");
        assert_eq!(reservation.envelope.id, next.id);
        queue.ack(&reservation).await?;

        let reservation = queue
            .reserve(&name, Duration::from_secs(2))
            .await?
            .expect("retried job should come back after its backoff");
        assert_eq!(reservation.envelope.id, failing.id);
        assert_eq!(reservation.envelope.attempts, 1);
        queue.ack(&reservation).await?;
        assert_eq!(queue.pending_len(&name).await?, 0);
        Ok(())
    }
}
