//! Queue capabilities: the consumer/publisher contracts and the retry policy
//! the driving loop applies between redeliveries.

pub mod publisher;
pub mod runner;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;

use crate::errors::{ConsumeError, PublishError};

/// What the driving loop should do with a message after `handle` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Fully processed; remove from the queue.
    Ack,
    /// Transient failure; redeliver after backoff, bounded by the runner's
    /// retry policy.
    Retry,
    /// Permanent failure; route to the dead-letter queue, never redeliver.
    Reject { reason: String },
}

impl From<ConsumeError> for Outcome {
    fn from(e: ConsumeError) -> Self {
        match e {
            ConsumeError::Transient(_) | ConsumeError::CacheMiss(_) => Outcome::Retry,
            ConsumeError::Malformed(_) | ConsumeError::InvalidTransition(_) => Outcome::Reject {
                reason: e.to_string(),
            },
        }
    }
}

/// A consumer bound to one named queue. The driving loop decodes nothing:
/// it hands over the raw body and interprets the returned `Outcome`.
///
/// `handle` must be idempotent — broker redelivery on crash-before-ack is
/// expected, so the same logical message may arrive more than once.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    fn queue_name(&self) -> &str;
    async fn handle(&self, raw: &[u8]) -> Outcome;
}

/// A publisher bound to one named queue. `publish` returns only after the
/// broker confirms acceptance; on error the caller owns the retry.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    fn queue_name(&self) -> &str;
    async fn publish(&self, payload: &Value) -> Result<(), PublishError>;
}

/// Exponential backoff with jitter, bounded attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Deliveries allowed before a retried message is dead-lettered.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor in [0.0, 1.0]; 0.1 spreads delays by ±10%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay before redelivery attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (base_ms * 2_f64.powi(attempt.saturating_sub(1) as i32)).min(max_ms);

        let jittered = if self.jitter > 0.0 {
            let spread = delay_ms * self.jitter;
            delay_ms + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            delay_ms
        };

        Duration::from_millis(jittered.max(0.0) as u64)
    }
}
