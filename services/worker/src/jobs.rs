//! Job payloads and the failures a handler reports to the queue

use common::error::DatabaseError;
use common::id::parse_id;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Request to derive thumbnails for an uploaded image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailJob {
    pub file_id: Option<String>,
    pub user_id: Option<String>,
}

impl ThumbnailJob {
    pub fn new(file_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            file_id: Some(file_id.into()),
            user_id: Some(user_id.into()),
        }
    }

    /// Check presence then format of both ids
    ///
    /// A malformed id is reported exactly like an unknown file.
    pub fn validate(&self) -> Result<(Uuid, Uuid), JobError> {
        let user_id = present(&self.user_id).ok_or(JobError::MissingUserId)?;
        let file_id = present(&self.file_id).ok_or(JobError::MissingFileId)?;

        match (parse_id(file_id), parse_id(user_id)) {
            (Some(file_id), Some(user_id)) => Ok((file_id, user_id)),
            _ => Err(JobError::EntityNotFound(EntityKind::File)),
        }
    }
}

/// Request to welcome a newly registered user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeJob {
    pub user_id: Option<String>,
}

impl WelcomeJob {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }

    pub fn validate(&self) -> Result<Uuid, JobError> {
        let user_id = present(&self.user_id).ok_or(JobError::MissingUserId)?;
        parse_id(user_id).ok_or(JobError::EntityNotFound(EntityKind::User))
    }
}

// Empty strings count as missing.
fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Kind of record a job failed to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    User,
    File,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::User => f.write_str("User"),
            EntityKind::File => f.write_str("File"),
        }
    }
}

/// Why a single delivery of a job failed
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Missing userId")]
    MissingUserId,

    #[error("Missing fileId")]
    MissingFileId,

    /// Covers both malformed ids and records that do not exist
    #[error("{0} not found")]
    EntityNotFound(EntityKind),

    #[error("Entity store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Notification failed: {0}")]
    Notification(anyhow::Error),
}
