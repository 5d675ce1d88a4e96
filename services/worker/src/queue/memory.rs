//! In-process queue storage for tests and single-process runs

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, timeout_at};
use uuid::Uuid;

use super::{DeadLetter, JobEnvelope, QueueBackend, QueueResult, Reservation};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<JobEnvelope>,
    processing: HashMap<Uuid, JobEnvelope>,
    dead: Vec<DeadLetter>,
}

#[derive(Clone, Default)]
pub struct MemoryQueue {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs reserved but not yet acked, retried or dead-lettered
    pub async fn in_flight(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map_or(0, |state| state.processing.len())
    }

    pub async fn dead_letters(&self, queue: &str) -> Vec<DeadLetter> {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|state| state.dead.clone())
            .unwrap_or_default()
    }

    /// Take the oldest due job, or report how long until the next one is due
    async fn try_reserve(&self, queue: &str) -> Poll {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Poll::Empty;
        };

        let now = Utc::now();
        let Some(index) = state.pending.iter().position(|job| job.is_due(now)) else {
            return match state.pending.iter().map(|job| job.available_at).min() {
                Some(next) => Poll::Delayed((next - now).to_std().unwrap_or(Duration::ZERO)),
                None => Poll::Empty,
            };
        };

        let Some(envelope) = state.pending.remove(index) else {
            return Poll::Empty;
        };
        state.processing.insert(envelope.id, envelope.clone());

        Poll::Ready(Reservation {
            receipt: envelope.id.to_string(),
            envelope,
        })
    }
}

enum Poll {
    Ready(Reservation),
    Delayed(Duration),
    Empty,
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn push(&self, envelope: &JobEnvelope) -> QueueResult<()> {
        self.queues
            .lock()
            .await
            .entry(envelope.queue.clone())
            .or_default()
            .pending
            .push_back(envelope.clone());
        self.notify.notify_waiters();
        Ok(())
    }

    async fn reserve(&self, queue: &str, wait: Duration) -> QueueResult<Option<Reservation>> {
        let deadline = Instant::now() + wait;

        loop {
            // Registered before checking so a push in between still wakes us
            let notified = self.notify.notified();

            let wake = match self.try_reserve(queue).await {
                Poll::Ready(reservation) => return Ok(Some(reservation)),
                Poll::Delayed(until_due) => Instant::now()
                    .checked_add(until_due)
                    .map_or(deadline, |due| due.min(deadline)),
                Poll::Empty => deadline,
            };

            if timeout_at(wake, notified).await.is_err() && wake >= deadline {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, reservation: &Reservation) -> QueueResult<()> {
        if let Some(state) = self
            .queues
            .lock()
            .await
            .get_mut(&reservation.envelope.queue)
        {
            state.processing.remove(&reservation.envelope.id);
        }
        Ok(())
    }

    async fn retry(&self, reservation: &Reservation, delay: Duration) -> QueueResult<()> {
        let envelope = reservation.envelope.retried(delay);

        {
            let mut queues = self.queues.lock().await;
            let state = queues.entry(envelope.queue.clone()).or_default();
            state.processing.remove(&envelope.id);
            state.pending.push_back(envelope);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, reservation: &Reservation, reason: &str) -> QueueResult<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .entry(reservation.envelope.queue.clone())
            .or_default();
        state.processing.remove(&reservation.envelope.id);
        state.dead.push(DeadLetter {
            envelope: reservation.envelope.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn pending_len(&self, queue: &str) -> QueueResult<u64> {
        Ok(self
            .queues
            .lock()
            .await
            .get(queue)
            .map_or(0, |state| state.pending.len() as u64))
    }
}
