use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Creates and returns a PostgreSQL connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    info!("PostgreSQL connection pool established");
    Ok(pool)
}

/// Idempotent schema bootstrap, run once at startup.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS user_aggregates (
             user_id TEXT PRIMARY KEY,
             content JSONB NOT NULL DEFAULT '{}'::jsonb
         )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS pending_jobs (
             correlation_id TEXT PRIMARY KEY,
             user_id TEXT NOT NULL,
             job_context JSONB NOT NULL,
             dispatched BOOLEAN NOT NULL DEFAULT FALSE,
             created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
             claimed_at TIMESTAMPTZ
         )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS pending_jobs_undispatched_idx
         ON pending_jobs (created_at)
         WHERE dispatched = FALSE",
    )
    .execute(pool)
    .await?;

    Ok(())
}
