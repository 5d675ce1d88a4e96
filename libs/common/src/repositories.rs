//! Entity lookups against the persistent store
//!
//! Every file lookup is scoped to its owner, so a caller can never reach
//! another user's file by guessing its identifier.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DatabaseError, DatabaseResult};
use crate::models::{FileRecord, UserRecord};

/// Read access to users and files
#[async_trait]
pub trait EntityLookup: Send + Sync {
    /// Find a user by ID
    async fn find_user(&self, id: Uuid) -> DatabaseResult<Option<UserRecord>>;

    /// Find a user by email
    async fn find_user_by_email(&self, email: &str) -> DatabaseResult<Option<UserRecord>>;

    /// Find a file by ID, only if it belongs to `owner_id`
    async fn find_file(&self, id: Uuid, owner_id: Uuid) -> DatabaseResult<Option<FileRecord>>;
}

/// PostgreSQL-backed entity store
#[derive(Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityLookup for PgEntityStore {
    async fn find_user(&self, id: Uuid) -> DatabaseResult<Option<UserRecord>> {
        debug!("Finding user by ID: {}", id);

        sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, email, password_hash, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::Query)
    }

    async fn find_user_by_email(&self, email: &str) -> DatabaseResult<Option<UserRecord>> {
        debug!("Finding user by email: {}", email);

        sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, email, password_hash, created_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::Query)
    }

    async fn find_file(&self, id: Uuid, owner_id: Uuid) -> DatabaseResult<Option<FileRecord>> {
        debug!("Finding file {} owned by {}", id, owner_id);

        sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT id, user_id, name, type, local_path, created_at
            FROM files
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::Query)
    }
}

/// In-memory entity store for local runs and tests
#[derive(Clone, Default)]
pub struct MemoryEntityStore {
    users: Arc<RwLock<HashMap<Uuid, UserRecord>>>,
    files: Arc<RwLock<HashMap<Uuid, FileRecord>>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: UserRecord) {
        self.users.write().await.insert(user.id, user);
    }

    pub async fn insert_file(&self, file: FileRecord) {
        self.files.write().await.insert(file.id, file);
    }
}

#[async_trait]
impl EntityLookup for MemoryEntityStore {
    async fn find_user(&self, id: Uuid) -> DatabaseResult<Option<UserRecord>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> DatabaseResult<Option<UserRecord>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|user| user.email == email)
            .cloned())
    }

    async fn find_file(&self, id: Uuid, owner_id: Uuid) -> DatabaseResult<Option<FileRecord>> {
        Ok(self
            .files
            .read()
            .await
            .get(&id)
            .filter(|file| file.user_id == owner_id)
            .cloned())
    }
}
