//! Common library for the file service
//!
//! This crate provides shared functionality used across the auth and worker
//! services: PostgreSQL and Redis connectivity, the expiring key-value
//! capability backing sessions, identifier validation and entity lookups.

pub mod cache;
pub mod database;
pub mod error;
pub mod id;
pub mod models;
pub mod repositories;

/// Example usage of the entity lookup
///
/// ```rust,no_run
/// use common::database::{DatabaseConfig, init_pool};
/// use common::id::parse_id;
/// use common::repositories::{EntityLookup, PgEntityStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = DatabaseConfig::from_env()?;
///     let pool = init_pool(&config).await?;
///     let store = PgEntityStore::new(pool);
///     if let Some(id) = parse_id("5f0c3a9e-8d53-4a5b-9d4e-0b7f4c1c2d3e") {
///         let user = store.find_user(id).await?;
///         println!("Found user: {:?}", user.map(|u| u.email));
///     }
///     Ok(())
/// }
/// ```
pub fn example_usage() {}
