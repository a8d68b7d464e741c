//! Result persistence
//!
//! Scored checks are written to a local libsql database through a pooled
//! connection. The schema is owned by [`migrations`].

pub mod migrations;
pub mod repository;

pub use repository::ResultStore;

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
