/// Database connection handling for the Sambaza bridge
///
/// PostgreSQL pool creation, connectivity checks and migrations. The store
/// layer builds on the pool this module hands out; connection limits are
/// bounded so excess callers wait with a deadline instead of piling up.

use sambaza_config::DatabaseConfig;
use sambaza_errors::{BridgeError, Result};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::{info, warn};

/// Create a PostgreSQL connection pool
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout))
        .connect(&config.url)
        .await
        .map_err(BridgeError::Database)?;

    test_connection(&pool).await?;

    info!("Database connection pool created");
    Ok(pool)
}

/// Test database connectivity
async fn test_connection(pool: &PgPool) -> Result<()> {
    let row = sqlx::query("SELECT version(), now() as current_time")
        .fetch_one(pool)
        .await?;

    let version: String = row.get("version");
    let current_time: chrono::DateTime<chrono::Utc> = row.get("current_time");

    info!(
        "Database connected - Version: {}, Time: {}",
        version.split_whitespace().take(2).collect::<Vec<_>>().join(" "),
        current_time.format("%Y-%m-%d %H:%M:%S UTC")
    );

    Ok(())
}

/// Run database migrations on startup
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running database migrations...");

    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| BridgeError::Internal(anyhow::Error::new(e)))?;

    info!("Database migrations completed");
    Ok(())
}

/// Database health information for the /health endpoint
#[derive(Debug, serde::Serialize)]
pub struct DatabaseHealth {
    pub status: String,
    pub response_time_ms: u64,
}

/// Check database responsiveness
pub async fn health_check(pool: &PgPool) -> Result<DatabaseHealth> {
    let start = std::time::Instant::now();

    sqlx::query("SELECT 1").fetch_one(pool).await?;

    let response_time = start.elapsed();
    let status = if response_time.as_millis() < 100 {
        "healthy"
    } else if response_time.as_millis() < 1000 {
        "degraded"
    } else {
        "unhealthy"
    };

    if status != "healthy" {
        warn!(
            "Database health check: {} ({}ms response time)",
            status,
            response_time.as_millis()
        );
    }

    Ok(DatabaseHealth {
        status: status.to_string(),
        response_time_ms: response_time.as_millis() as u64,
    })
}

/// Initialize the pool from configuration, running migrations if requested
pub async fn init(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = create_pool(config).await?;

    if config.run_migrations {
        run_migrations(&pool).await?;
    }

    Ok(pool)
}
