mod cache;
mod config;
mod consumers;
mod db;
mod errors;
mod models;
mod queue;
mod refiller;
mod store;
mod submit;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::RedisCorrelationCache;
use crate::config::Config;
use crate::consumers::application_manager::ApplicationManagerConsumer;
use crate::consumers::career_docs::CareerDocsConsumer;
use crate::queue::publisher::StreamPublisher;
use crate::queue::runner::ConsumerRunner;
use crate::queue::{QueueConsumer, RetryPolicy};
use crate::refiller::TimedQueueRefiller;
use crate::store::PgApplicationStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails fast on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting pipeline v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let pool = db::create_pool(&config.database_url).await?;
    db::ensure_schema(&pool).await?;

    // Initialize Redis (broker + correlation cache share the client)
    let redis_client = redis::Client::open(config.redis_url.clone())?;
    let cache = Arc::new(RedisCorrelationCache::connect(&redis_client).await?);
    info!("Redis client initialized");

    let store = Arc::new(PgApplicationStore::new(pool));
    let generation_publisher = Arc::new(
        StreamPublisher::connect(&redis_client, config.generation_queue.clone()).await?,
    );

    let retry = RetryPolicy {
        max_attempts: config.max_attempts,
        ..RetryPolicy::default()
    };
    let token = CancellationToken::new();
    let mut tasks = Vec::new();

    // Consumers: one independent task per queue, communicating only through
    // the broker and the shared store/cache.
    let consumers: Vec<Arc<dyn QueueConsumer>> = vec![
        Arc::new(CareerDocsConsumer::new(
            config.response_queue.clone(),
            cache.clone(),
            store.clone(),
        )),
        Arc::new(ApplicationManagerConsumer::new(
            config.status_queue.clone(),
            store.clone(),
        )),
    ];
    for consumer in consumers {
        let runner = ConsumerRunner::new(
            redis_client.clone(),
            config.consumer_group.clone(),
            retry.clone(),
        );
        let task_token = token.child_token();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = runner.run(consumer, task_token).await {
                error!(error = %e, "consumer task terminated");
            }
        }));
    }

    // Refiller: periodic dispatch of pending jobs to the generation queue.
    let refiller = TimedQueueRefiller::new(
        store,
        cache,
        generation_publisher,
        config.refill_interval,
        config.refill_batch_size,
        config.cache_ttl,
    );
    let refiller_token = token.child_token();
    tasks.push(tokio::spawn(async move {
        refiller.run(refiller_token).await;
    }));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining consumers");
    token.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("Pipeline stopped");

    Ok(())
}
