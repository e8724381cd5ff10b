//! Database pool lifecycle
//!
//! The pool is created once by the process entry point and injected into the
//! stores; nothing else opens connections.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Create the application connection pool.
///
/// Bounded acquire timeout so a saturated database surfaces as an error
/// instead of hanging request handlers.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}
