//! Sign-in and sign-out flows

use anyhow::Result;
use common::repositories::EntityLookup;
use std::sync::Arc;
use tracing::{info, warn};

use crate::credentials::{Credentials, verify_password};
use crate::session::SessionStore;

/// Checks credentials against the user store and manages their sessions
#[derive(Clone)]
pub struct Authenticator {
    users: Arc<dyn EntityLookup>,
    sessions: SessionStore,
}

impl Authenticator {
    pub fn new(users: Arc<dyn EntityLookup>, sessions: SessionStore) -> Self {
        Self { users, sessions }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Sign a user in, returning a fresh session token
    ///
    /// Returns `None` when the email is unknown or the password is wrong.
    pub async fn sign_in(&self, credentials: &Credentials) -> Result<Option<String>> {
        let Some(user) = self.users.find_user_by_email(&credentials.email).await? else {
            info!("Sign-in rejected: unknown email");
            return Ok(None);
        };

        if !verify_password(&user.password_hash, &credentials.password)? {
            warn!("Sign-in rejected for user {}: wrong password", user.id);
            return Ok(None);
        }

        let token = self.sessions.issue(user.id).await?;
        Ok(Some(token))
    }

    /// Sign the holder of `token` out
    ///
    /// Returns `false` when the token does not resolve to a session.
    pub async fn sign_out(&self, token: &str) -> Result<bool> {
        let Some(user_id) = self.sessions.resolve(token).await? else {
            return Ok(false);
        };

        info!("Signing out user: {}", user_id);
        self.sessions.revoke(token).await?;
        Ok(true)
    }
}
