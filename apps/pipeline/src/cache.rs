//! Correlation cache: job context parked between dispatch and response.
//!
//! Entries are written by the refiller when a job is dispatched and read by
//! the merge consumer when the matching response arrives. The consumer deletes
//! an entry only after the merged record is durably stored, so a failed write
//! leaves the context in place for the redelivery. TTL reclaims entries whose
//! response never comes.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde_json::Value;
use tracing::debug;

use crate::errors::CacheError;

/// Capability handle passed into components at construction; tests substitute
/// an in-memory fake.
#[async_trait]
pub trait CorrelationCache: Send + Sync {
    /// Store `job_context` under `correlation_id` with the given TTL,
    /// replacing any previous entry for the same id.
    async fn put(
        &self,
        correlation_id: &str,
        job_context: &Value,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Fetch the entry without removing it. `None` means expired, never
    /// written, or already removed — the caller decides which of those is
    /// recoverable.
    async fn get(&self, correlation_id: &str) -> Result<Option<Value>, CacheError>;

    /// Drop the entry once its context has been durably persisted. Removing
    /// an absent entry is not an error.
    async fn remove(&self, correlation_id: &str) -> Result<(), CacheError>;
}

/// Redis-backed cache: `SET EX` on write, `GET` on read, `DEL` once the
/// caller has stored the context.
#[derive(Clone)]
pub struct RedisCorrelationCache {
    conn: MultiplexedConnection,
}

impl RedisCorrelationCache {
    pub async fn connect(client: &redis::Client) -> Result<Self, CacheError> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(RedisCorrelationCache { conn })
    }
}

#[async_trait]
impl CorrelationCache for RedisCorrelationCache {
    async fn put(
        &self,
        correlation_id: &str,
        job_context: &Value,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let body = serde_json::to_string(job_context)
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(correlation_id)
            .arg(body)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;

        debug!(correlation_id, ttl_secs = ttl.as_secs(), "cached job context");
        Ok(())
    }

    async fn get(&self, correlation_id: &str) -> Result<Option<Value>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(correlation_id)
            .query_async(&mut conn)
            .await?;

        match raw {
            Some(body) => {
                let value = serde_json::from_str(&body).map_err(|e| {
                    CacheError::Backend(format!(
                        "corrupted cache entry for '{correlation_id}': {e}"
                    ))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, correlation_id: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(correlation_id)
            .query_async::<_, u64>(&mut conn)
            .await?;
        Ok(())
    }
}
