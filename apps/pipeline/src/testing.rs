//! Deterministic in-memory fakes for the cache, store, and publisher
//! capabilities. Shared by the consumer, refiller, and submission tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::cache::CorrelationCache;
use crate::errors::{CacheError, PublishError, StoreError};
use crate::models::application::{ApplicationRecord, ApplicationStatus};
use crate::queue::QueuePublisher;
use crate::store::{ApplicationStore, ClaimedJob, TransitionOutcome, UpsertOutcome};

// ────────────────────────────────────────────────────────────────────────────
// Cache fake
// ────────────────────────────────────────────────────────────────────────────

pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Value, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn put_entry(&self, key: &str, value: Value, ttl: Duration) {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value, Instant::now() + ttl));
    }

    /// Non-consuming peek, honoring expiry.
    pub async fn get_entry(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock().await;
        let (value, expires_at) = entries.get(key)?;
        if Instant::now() >= *expires_at {
            return None;
        }
        Some(value.clone())
    }
}

#[async_trait]
impl CorrelationCache for MemoryCache {
    async fn put(&self, correlation_id: &str, job_context: &Value, ttl: Duration) -> Result<(), CacheError> {
        self.put_entry(correlation_id, job_context.clone(), ttl).await;
        Ok(())
    }

    async fn get(&self, correlation_id: &str) -> Result<Option<Value>, CacheError> {
        Ok(self.get_entry(correlation_id).await)
    }

    async fn remove(&self, correlation_id: &str) -> Result<(), CacheError> {
        self.entries.lock().await.remove(correlation_id);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Store fake
// ────────────────────────────────────────────────────────────────────────────

struct PendingRow {
    correlation_id: String,
    user_id: String,
    job_context: Value,
    dispatched: bool,
}

pub struct MemoryStore {
    aggregates: Mutex<HashMap<String, HashMap<String, ApplicationRecord>>>,
    pending: Mutex<Vec<PendingRow>>,
    fail_next: AtomicBool,
    fail_next_insert: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            aggregates: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            fail_next_insert: AtomicBool::new(false),
        }
    }

    /// Make the next store operation fail as if the backend were unreachable.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Make only the next `insert_generated` fail, leaving reads working.
    pub fn fail_next_insert(&self) {
        self.fail_next_insert.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<(), StoreError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            Err(StoreError::Backend("simulated outage".into()))
        } else {
            Ok(())
        }
    }

    pub async fn seed_record(&self, user_id: &str, record: ApplicationRecord) {
        self.aggregates
            .lock()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(record.correlation_id.clone(), record);
    }

    pub async fn record(&self, user_id: &str, correlation_id: &str) -> Option<ApplicationRecord> {
        self.aggregates
            .lock()
            .await
            .get(user_id)?
            .get(correlation_id)
            .cloned()
    }

    pub async fn record_count(&self, user_id: &str) -> usize {
        self.aggregates
            .lock()
            .await
            .get(user_id)
            .map(|content| content.len())
            .unwrap_or(0)
    }

    pub async fn seed_pending(&self, correlation_id: &str, user_id: &str, job_context: Value) {
        self.pending.lock().await.push(PendingRow {
            correlation_id: correlation_id.to_string(),
            user_id: user_id.to_string(),
            job_context,
            dispatched: false,
        });
    }

    pub async fn undispatched_count(&self) -> usize {
        self.pending
            .lock()
            .await
            .iter()
            .filter(|row| !row.dispatched)
            .count()
    }
}

#[async_trait]
impl ApplicationStore for MemoryStore {
    async fn insert_generated(
        &self,
        user_id: &str,
        record: &ApplicationRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        self.check_failure()?;
        if self.fail_next_insert.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("simulated outage".into()));
        }
        let mut aggregates = self.aggregates.lock().await;
        let content = aggregates.entry(user_id.to_string()).or_default();
        if content.contains_key(&record.correlation_id) {
            Ok(UpsertOutcome::AlreadyPresent)
        } else {
            content.insert(record.correlation_id.clone(), record.clone());
            Ok(UpsertOutcome::Inserted)
        }
    }

    async fn apply_status(
        &self,
        user_id: &str,
        correlation_id: &str,
        new_status: ApplicationStatus,
        reason: Option<&str>,
    ) -> Result<TransitionOutcome, StoreError> {
        self.check_failure()?;
        let mut aggregates = self.aggregates.lock().await;
        let record = match aggregates
            .get_mut(user_id)
            .and_then(|content| content.get_mut(correlation_id))
        {
            Some(record) => record,
            None => return Ok(TransitionOutcome::NotFound),
        };

        if record.status == new_status {
            return Ok(TransitionOutcome::AlreadyApplied);
        }
        if !record.status.can_advance_to(new_status) {
            return Ok(TransitionOutcome::Invalid {
                current: record.status,
            });
        }

        record.status = new_status;
        if new_status == ApplicationStatus::Sent {
            record.sent = true;
        }
        if let Some(reason) = reason {
            record.reason = Some(reason.to_string());
        }
        record.updated_at = Utc::now();
        Ok(TransitionOutcome::Applied)
    }

    async fn get_record(
        &self,
        user_id: &str,
        correlation_id: &str,
    ) -> Result<Option<ApplicationRecord>, StoreError> {
        self.check_failure()?;
        Ok(self.record(user_id, correlation_id).await)
    }

    async fn claim_batch(&self, limit: i64) -> Result<Vec<ClaimedJob>, StoreError> {
        self.check_failure()?;
        let mut pending = self.pending.lock().await;
        let mut claimed = Vec::new();
        for row in pending.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if !row.dispatched {
                row.dispatched = true;
                claimed.push(ClaimedJob {
                    correlation_id: row.correlation_id.clone(),
                    user_id: row.user_id.clone(),
                    job_context: row.job_context.clone(),
                });
            }
        }
        Ok(claimed)
    }

    async fn release_claim(&self, correlation_id: &str) -> Result<(), StoreError> {
        self.check_failure()?;
        let mut pending = self.pending.lock().await;
        if let Some(row) = pending
            .iter_mut()
            .find(|row| row.correlation_id == correlation_id)
        {
            row.dispatched = false;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Publisher fake
// ────────────────────────────────────────────────────────────────────────────

pub struct CapturePublisher {
    queue: String,
    published: Mutex<Vec<Value>>,
    failures: Mutex<HashSet<String>>,
}

impl CapturePublisher {
    pub fn new(queue: &str) -> Self {
        CapturePublisher {
            queue: queue.to_string(),
            published: Mutex::new(Vec::new()),
            failures: Mutex::new(HashSet::new()),
        }
    }

    /// Fail publishes whose payload concerns the given correlation id.
    pub async fn fail_for(&self, correlation_id: &str) {
        self.failures.lock().await.insert(correlation_id.to_string());
    }

    pub async fn clear_failures(&self) {
        self.failures.lock().await.clear();
    }

    pub async fn published(&self) -> Vec<Value> {
        self.published.lock().await.clone()
    }

    fn concerns(payload: &Value, correlation_id: &str) -> bool {
        payload
            .get("correlation_id")
            .and_then(Value::as_str)
            .is_some_and(|id| id == correlation_id)
            || payload
                .get("content")
                .and_then(|content| content.get(correlation_id))
                .is_some()
    }
}

#[async_trait]
impl QueuePublisher for CapturePublisher {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn publish(&self, payload: &Value) -> Result<(), PublishError> {
        let failures = self.failures.lock().await;
        if failures.iter().any(|id| Self::concerns(payload, id)) {
            return Err(PublishError::Broker {
                queue: self.queue.clone(),
                reason: "simulated publish failure".into(),
            });
        }
        drop(failures);

        self.published.lock().await.push(payload.clone());
        Ok(())
    }
}
