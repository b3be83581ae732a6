use thiserror::Error;

/// Failure taxonomy for message processing.
///
/// Each variant maps to exactly one queue `Outcome` (see `queue::Outcome`),
/// so consumer code never touches broker control flow directly.
#[derive(Debug, Error)]
pub enum ConsumeError {
    /// Cache or store temporarily unreachable. Retried with backoff.
    #[error("transient I/O failure: {0}")]
    Transient(String),

    /// No cached job context for the correlation id. Retried a bounded number
    /// of times (the cache write may race the response), then dead-lettered.
    #[error("no cached job context for correlation id '{0}'")]
    CacheMiss(String),

    /// Schema violation in the incoming message. Rejected immediately.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Status regression or transition on a missing/terminal record.
    /// Rejected with the diagnostic; never retried.
    #[error("invalid status transition: {0}")]
    InvalidTransition(String),
}

impl From<serde_json::Error> for ConsumeError {
    fn from(e: serde_json::Error) -> Self {
        ConsumeError::Malformed(e.to_string())
    }
}

impl From<CacheError> for ConsumeError {
    fn from(e: CacheError) -> Self {
        ConsumeError::Transient(e.to_string())
    }
}

impl From<StoreError> for ConsumeError {
    fn from(e: StoreError) -> Self {
        ConsumeError::Transient(e.to_string())
    }
}

/// Correlation cache failure.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

/// Application store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Publish failure. The caller owns the retry (for the refiller: the claim is
/// rolled back and the item is retried on the next cycle).
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker rejected publish to '{queue}': {reason}")]
    Broker { queue: String, reason: String },

    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}
