use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Queue names are configuration, never hardcoded in the consumers.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    /// Outbound queue the refiller publishes generation jobs to.
    pub generation_queue: String,
    /// Queue carrying AI-generated career-document responses.
    pub response_queue: String,
    /// Queue carrying status notifications from the automation service.
    pub status_queue: String,
    /// Outbound queue for application submission documents. Consumed by the
    /// submission publisher, which the edit/browse layer drives.
    #[allow(dead_code)]
    pub submission_queue: String,
    /// Consumer group name shared by all replicas of this process.
    pub consumer_group: String,
    /// TTL for correlation cache entries. Must exceed the expected
    /// AI-service turnaround or responses will miss their context.
    pub cache_ttl: Duration,
    pub refill_interval: Duration,
    pub refill_batch_size: i64,
    /// Bound on redeliveries before a message is dead-lettered.
    pub max_attempts: u32,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            generation_queue: env_or("GENERATION_QUEUE", "career_docs_dispatch"),
            response_queue: env_or("RESPONSE_QUEUE", "career_docs_response"),
            status_queue: env_or("STATUS_QUEUE", "application_status"),
            submission_queue: env_or("SUBMISSION_QUEUE", "application_submit"),
            consumer_group: env_or("CONSUMER_GROUP", "pipeline"),
            cache_ttl: Duration::from_secs(env_parse("CACHE_TTL_SECS", 1800)?),
            refill_interval: Duration::from_secs(env_parse("REFILL_INTERVAL_SECS", 600)?),
            refill_batch_size: env_parse("REFILL_BATCH_SIZE", 20)?,
            max_attempts: env_parse("CONSUMER_MAX_ATTEMPTS", 5)?,
            rust_log: env_or("RUST_LOG", "info"),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("'{key}' must be a valid number, got '{raw}'")),
        Err(_) => Ok(default),
    }
}
