//! CareerDocs merge consumer.
//!
//! Reunites an AI-generated response with the job context cached at dispatch
//! time and writes the completed record into the owning user aggregate.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cache::CorrelationCache;
use crate::errors::ConsumeError;
use crate::models::application::ApplicationRecord;
use crate::models::messages::ResponseMessage;
use crate::queue::{Outcome, QueueConsumer};
use crate::store::{ApplicationStore, UpsertOutcome};

pub struct CareerDocsConsumer {
    queue: String,
    cache: Arc<dyn CorrelationCache>,
    store: Arc<dyn ApplicationStore>,
}

impl CareerDocsConsumer {
    pub fn new(
        queue: String,
        cache: Arc<dyn CorrelationCache>,
        store: Arc<dyn ApplicationStore>,
    ) -> Self {
        CareerDocsConsumer {
            queue,
            cache,
            store,
        }
    }

    async fn process(&self, raw: &[u8]) -> Result<(), ConsumeError> {
        let msg: ResponseMessage = serde_json::from_slice(raw)?;
        if msg.user_id.is_empty() {
            return Err(ConsumeError::Malformed("empty user_id".into()));
        }
        if msg.correlation_id.is_empty() {
            return Err(ConsumeError::Malformed("empty correlation_id".into()));
        }

        // Redelivery after crash-before-ack: the cache entry was already
        // consumed and the record written, so the cache lookup would miss.
        // Checking the store first keeps the handler idempotent.
        if self
            .store
            .get_record(&msg.user_id, &msg.correlation_id)
            .await?
            .is_some()
        {
            debug!(
                correlation_id = %msg.correlation_id,
                user_id = %msg.user_id,
                "record already merged, acknowledging duplicate delivery"
            );
            return Ok(());
        }

        // A miss here is retried by the runner: the dispatch path's cache
        // write may not yet be visible. Exhausted retries dead-letter the
        // response rather than storing it without its context.
        //
        // The read is non-destructive. If the store write below fails, the
        // entry must still be there when the runner redelivers.
        let job_context = self
            .cache
            .get(&msg.correlation_id)
            .await?
            .ok_or_else(|| ConsumeError::CacheMiss(msg.correlation_id.clone()))?;

        let record = ApplicationRecord::generated(
            msg.correlation_id.clone(),
            job_context,
            msg.resume,
            msg.cover_letter,
        );

        match self.store.insert_generated(&msg.user_id, &record).await? {
            UpsertOutcome::Inserted => {
                info!(
                    correlation_id = %msg.correlation_id,
                    user_id = %msg.user_id,
                    "merged career docs response into aggregate"
                );
            }
            UpsertOutcome::AlreadyPresent => {
                // A concurrent replica won the insert between our store check
                // and this write. The aggregate is untouched either way.
                debug!(
                    correlation_id = %msg.correlation_id,
                    user_id = %msg.user_id,
                    "record inserted concurrently, write was a no-op"
                );
            }
        }

        // The record is durable; the cache entry has served its purpose.
        // Failure here is not worth a redelivery (TTL reclaims the entry).
        if let Err(e) = self.cache.remove(&msg.correlation_id).await {
            warn!(
                correlation_id = %msg.correlation_id,
                error = %e,
                "failed to drop cached context after merge"
            );
        }

        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for CareerDocsConsumer {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn handle(&self, raw: &[u8]) -> Outcome {
        match self.process(raw).await {
            Ok(()) => Outcome::Ack,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "failed to process response message");
                e.into()
            }
        }
    }
}
