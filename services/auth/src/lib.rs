//! Authentication for the file service
//!
//! Sessions are opaque bearer tokens kept in an expiring key-value store.
//! The HTTP layer calls [`Authenticator::sign_in`] on a credential check,
//! [`SessionStore::resolve`] on every protected request and
//! [`Authenticator::sign_out`] on sign-out.

pub mod authenticator;
pub mod credentials;
pub mod session;

pub use authenticator::Authenticator;
pub use credentials::{Credentials, hash_password, verify_password};
pub use session::{SESSION_TTL_SECONDS, SessionStore};
