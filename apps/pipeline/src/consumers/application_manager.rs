//! Application manager consumer.
//!
//! Applies status-transition notifications from the external automation
//! service onto stored applications. Transitions only ever move forward;
//! a visible rejection beats silent status corruption.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::errors::ConsumeError;
use crate::models::messages::StatusMessage;
use crate::queue::{Outcome, QueueConsumer};
use crate::store::{ApplicationStore, TransitionOutcome};

pub struct ApplicationManagerConsumer {
    queue: String,
    store: Arc<dyn ApplicationStore>,
}

impl ApplicationManagerConsumer {
    pub fn new(queue: String, store: Arc<dyn ApplicationStore>) -> Self {
        ApplicationManagerConsumer { queue, store }
    }

    async fn process(&self, raw: &[u8]) -> Result<(), ConsumeError> {
        let msg: StatusMessage = serde_json::from_slice(raw)?;
        if msg.user_id.is_empty() || msg.correlation_id.is_empty() {
            return Err(ConsumeError::Malformed(
                "empty user_id or correlation_id".into(),
            ));
        }

        let outcome = self
            .store
            .apply_status(
                &msg.user_id,
                &msg.correlation_id,
                msg.new_status,
                msg.reason.as_deref(),
            )
            .await?;

        match outcome {
            TransitionOutcome::Applied => {
                info!(
                    correlation_id = %msg.correlation_id,
                    user_id = %msg.user_id,
                    new_status = %msg.new_status,
                    "application status advanced"
                );
                Ok(())
            }
            TransitionOutcome::AlreadyApplied => {
                debug!(
                    correlation_id = %msg.correlation_id,
                    new_status = %msg.new_status,
                    "duplicate status notification, no-op"
                );
                Ok(())
            }
            TransitionOutcome::NotFound => Err(ConsumeError::InvalidTransition(format!(
                "no application '{}' for user '{}'",
                msg.correlation_id, msg.user_id
            ))),
            TransitionOutcome::Invalid { current } => {
                Err(ConsumeError::InvalidTransition(format!(
                    "'{}' cannot move {current} -> {}",
                    msg.correlation_id, msg.new_status
                )))
            }
            TransitionOutcome::Conflict => Err(ConsumeError::Transient(format!(
                "concurrent status change on '{}'",
                msg.correlation_id
            ))),
        }
    }
}

#[async_trait]
impl QueueConsumer for ApplicationManagerConsumer {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn handle(&self, raw: &[u8]) -> Outcome {
        match self.process(raw).await {
            Ok(()) => Outcome::Ack,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "failed to process status notification");
                e.into()
            }
        }
    }
}
