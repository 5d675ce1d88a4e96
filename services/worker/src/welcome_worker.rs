//! Greets newly registered users

use anyhow::Result;
use async_trait::async_trait;
use common::models::UserRecord;
use common::repositories::EntityLookup;
use std::sync::Arc;
use tracing::info;

use crate::jobs::{EntityKind, JobError, WelcomeJob};
use crate::queue::JobHandler;

/// Side effect emitted once a user is resolved
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn welcome(&self, user: &UserRecord) -> Result<()>;
}

/// Writes the greeting to the service log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn welcome(&self, user: &UserRecord) -> Result<()> {
        info!("Welcome {}!", user.email);
        Ok(())
    }
}

#[derive(Clone)]
pub struct WelcomeWorker {
    entities: Arc<dyn EntityLookup>,
    notifier: Arc<dyn Notifier>,
}

impl WelcomeWorker {
    pub fn new(entities: Arc<dyn EntityLookup>, notifier: Arc<dyn Notifier>) -> Self {
        Self { entities, notifier }
    }
}

#[async_trait]
impl JobHandler for WelcomeWorker {
    type Job = WelcomeJob;

    async fn handle(&self, job: WelcomeJob) -> Result<(), JobError> {
        let user_id = job.validate()?;

        let user = self
            .entities
            .find_user(user_id)
            .await?
            .ok_or(JobError::EntityNotFound(EntityKind::User))?;

        self.notifier
            .welcome(&user)
            .await
            .map_err(JobError::Notification)
    }
}
