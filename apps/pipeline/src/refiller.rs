//! Timed queue refiller.
//!
//! Periodically claims a bounded batch of not-yet-dispatched jobs, parks each
//! job's context in the correlation cache, and publishes the dispatch message
//! to the generation queue. The claim is atomic in the store, so overlapping
//! cycles (slow previous run, timer drift, another replica) can never
//! double-dispatch an item.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CorrelationCache;
use crate::errors::StoreError;
use crate::models::messages::DispatchMessage;
use crate::queue::QueuePublisher;
use crate::store::{ApplicationStore, ClaimedJob};

pub struct TimedQueueRefiller {
    store: Arc<dyn ApplicationStore>,
    cache: Arc<dyn CorrelationCache>,
    publisher: Arc<dyn QueuePublisher>,
    interval: Duration,
    batch_size: i64,
    cache_ttl: Duration,
}

impl TimedQueueRefiller {
    pub fn new(
        store: Arc<dyn ApplicationStore>,
        cache: Arc<dyn CorrelationCache>,
        publisher: Arc<dyn QueuePublisher>,
        interval: Duration,
        batch_size: i64,
        cache_ttl: Duration,
    ) -> Self {
        TimedQueueRefiller {
            store,
            cache,
            publisher,
            interval,
            batch_size,
            cache_ttl,
        }
    }

    /// Tick until cancelled. A tick already in progress runs to completion;
    /// the token is only consulted between ticks.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "queue refiller started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.refill_once().await {
                        Ok(published) if published > 0 => {
                            info!(published, "refill cycle dispatched jobs");
                        }
                        Ok(_) => debug!("refill cycle found no pending jobs"),
                        Err(e) => error!(error = %e, "refill cycle failed"),
                    }
                }
            }
        }

        info!("queue refiller stopped");
    }

    /// One refill cycle: claim, then dispatch each claimed job. A failure on
    /// one item releases that item's claim and moves on; it never aborts the
    /// rest of the batch.
    pub async fn refill_once(&self) -> Result<usize, StoreError> {
        let jobs = self.store.claim_batch(self.batch_size).await?;
        let mut published = 0;

        for job in jobs {
            match self.dispatch(&job).await {
                Ok(()) => published += 1,
                Err(e) => {
                    warn!(
                        correlation_id = %job.correlation_id,
                        error = %e,
                        "dispatch failed, releasing claim for next cycle"
                    );
                    if let Err(release_err) = self.store.release_claim(&job.correlation_id).await {
                        // The claim stays marked dispatched; operator
                        // intervention or a sweep job has to resurface it.
                        error!(
                            correlation_id = %job.correlation_id,
                            error = %release_err,
                            "failed to release claim after dispatch failure"
                        );
                    }
                }
            }
        }

        Ok(published)
    }

    /// Cache first, publish second: the response consumer relies on the
    /// context being visible no later than the response. A failed publish
    /// leaves the cache entry to TTL reclaim.
    async fn dispatch(&self, job: &ClaimedJob) -> anyhow::Result<()> {
        self.cache
            .put(&job.correlation_id, &job.job_context, self.cache_ttl)
            .await?;

        let message = DispatchMessage {
            correlation_id: job.correlation_id.clone(),
            user_id: job.user_id.clone(),
            job_context: job.job_context.clone(),
        };
        self.publisher
            .publish(&serde_json::to_value(&message)?)
            .await?;

        debug!(correlation_id = %job.correlation_id, "job dispatched for generation");
        Ok(())
    }
}
