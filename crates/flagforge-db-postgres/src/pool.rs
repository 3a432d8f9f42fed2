//! Connection pool management for the PostgreSQL flag store.

use std::time::Duration;

use sqlx_core::pool::PoolOptions;
use sqlx_postgres::{PgPool, Postgres};
use tracing::{debug, info, instrument, warn};

use crate::config::PostgresConfig;
use crate::error::{PostgresError, Result};

/// Type alias for PostgreSQL pool options.
pub type PgPoolOptions = PoolOptions<Postgres>;

/// Creates a new PostgreSQL connection pool from the given configuration.
#[instrument(skip(config), fields(url = %mask_password(&config.url)))]
pub async fn create_pool(config: &PostgresConfig) -> Result<PgPool> {
    info!(
        pool_size = config.pool_size,
        connect_timeout_ms = config.connect_timeout_ms,
        "Creating PostgreSQL connection pool"
    );

    let min_connections = (config.pool_size / 4).max(1);

    let mut options = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .min_connections(min_connections)
        .acquire_timeout(Duration::from_millis(config.connect_timeout_ms))
        .test_before_acquire(false);

    if let Some(idle_timeout) = config.idle_timeout_ms {
        options = options.idle_timeout(Duration::from_millis(idle_timeout));
    }

    let pool = options.connect(&config.url).await?;

    debug!("PostgreSQL connection pool created successfully");

    Ok(pool)
}

/// Creates a pool and verifies it with `SELECT 1`, retrying while the
/// database is still coming up.
pub async fn connect_with_retry(config: &PostgresConfig) -> Result<PgPool> {
    let attempts = config.connect_attempts.max(1);
    let delay = Duration::from_millis(config.connect_retry_delay_ms);
    let mut last_err = None;

    for attempt in 1..=attempts {
        let result = match create_pool(config).await {
            Ok(pool) => test_connection(&pool).await.map(|()| pool),
            Err(e) => Err(e),
        };
        match result {
            Ok(pool) => return Ok(pool),
            Err(e) => {
                warn!(error = %e, attempt, max_attempts = attempts, "waiting for postgres");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| PostgresError::config("no connection attempts made")))
}

/// Tests the connection to the database.
#[instrument(skip(pool))]
pub async fn test_connection(pool: &PgPool) -> Result<()> {
    sqlx_core::query::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(PostgresError::from)?;

    debug!("Database connection test successful");

    Ok(())
}

/// Masks the password in a database URL for logging.
fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
            if colon_pos > scheme_end {
                return format!("{}:****{}", &url[..colon_pos], &url[at_pos..]);
            }
        }
    }
    url.to_string()
}
