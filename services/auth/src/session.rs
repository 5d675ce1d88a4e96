//! Session management over an expiring key-value store

use anyhow::Result;
use common::cache::TtlStore;
use common::id::parse_id;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Lifetime of a session token: 24 hours
pub const SESSION_TTL_SECONDS: u64 = 24 * 3600;

/// Issues, resolves and revokes session tokens
///
/// Each token is stored under `auth_<token>` with the owning user's ID as
/// value. Reads never extend a session; signing in again mints a new token.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn TtlStore>,
    ttl_seconds: u64,
}

impl SessionStore {
    /// Create a new session store with the default 24 hour TTL
    pub fn new(store: Arc<dyn TtlStore>) -> Self {
        Self {
            store,
            ttl_seconds: SESSION_TTL_SECONDS,
        }
    }

    /// Override the session TTL
    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    fn session_key(token: &str) -> String {
        format!("auth_{}", token)
    }

    /// Create a new session for a user and return its token
    pub async fn issue(&self, user_id: Uuid) -> Result<String> {
        info!("Creating session for user: {}", user_id);

        let token = Uuid::new_v4().to_string();
        self.store
            .set_ex(
                &Self::session_key(&token),
                &user_id.to_string(),
                self.ttl_seconds,
            )
            .await?;

        Ok(token)
    }

    /// Resolve a token to the user it was issued for
    pub async fn resolve(&self, token: &str) -> Result<Option<Uuid>> {
        let Some(value) = self.store.get(&Self::session_key(token)).await? else {
            return Ok(None);
        };

        match parse_id(&value) {
            Some(user_id) => Ok(Some(user_id)),
            None => {
                warn!("Session holds a malformed user id, ignoring it");
                Ok(None)
            }
        }
    }

    /// Delete a session. Revoking an unknown token is not an error.
    pub async fn revoke(&self, token: &str) -> Result<()> {
        info!("Deleting session");
        self.store.delete(&Self::session_key(token)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::cache::{ManualClock, MemoryTtlStore};
    use std::time::Duration;

    fn store_with_clock() -> (Arc<ManualClock>, MemoryTtlStore, SessionStore) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ttl = MemoryTtlStore::with_clock(clock.clone());
        let sessions = SessionStore::new(Arc::new(ttl.clone()));
        (clock, ttl, sessions)
    }

    #[tokio::test]
    async fn test_issue_then_resolve() -> Result<()> {
        let (_, _, sessions) = store_with_clock();
        let user_id = Uuid::new_v4();

        let token = sessions.issue(user_id).await?;
        assert!(Uuid::parse_str(&token).is_ok());
        assert_eq!(sessions.resolve(&token).await?, Some(user_id));
        Ok(())
    }

    #[tokio::test]
    async fn test_session_is_stored_under_auth_key() -> Result<()> {
        let (_, ttl, sessions) = store_with_clock();
        let user_id = Uuid::new_v4();

        let token = sessions.issue(user_id).await?;
        assert_eq!(
            ttl.get(&format!("auth_{}", token)).await?,
            Some(user_id.to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_revoked_token_never_resolves() -> Result<()> {
        let (_, _, sessions) = store_with_clock();
        let token = sessions.issue(Uuid::new_v4()).await?;

        sessions.revoke(&token).await?;
        assert_eq!(sessions.resolve(&token).await?, None);

        // Second revoke is a no-op
        sessions.revoke(&token).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_session_expires_after_24_hours() -> Result<()> {
        let (clock, _, sessions) = store_with_clock();
        let user_id = Uuid::new_v4();
        let token = sessions.issue(user_id).await?;

        clock.advance(Duration::from_secs(SESSION_TTL_SECONDS - 1));
        assert_eq!(sessions.resolve(&token).await?, Some(user_id));

        clock.advance(Duration::from_secs(1));
        assert_eq!(sessions.resolve(&token).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_custom_ttl() -> Result<()> {
        let (clock, ttl, _) = store_with_clock();
        let sessions = SessionStore::new(Arc::new(ttl)).with_ttl(60);
        let token = sessions.issue(Uuid::new_v4()).await?;

        clock.advance(Duration::from_secs(60));
        assert_eq!(sessions.resolve(&token).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_sessions_are_absent() -> Result<()> {
        let (_, ttl, sessions) = store_with_clock();
        assert_eq!(sessions.resolve("no-such-token").await?, None);

        ttl.set_ex("auth_corrupt", "not-a-user-id", 60).await?;
        assert_eq!(sessions.resolve("corrupt").await?, None);
        Ok(())
    }
}
