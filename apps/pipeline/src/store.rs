//! Application store: the durable per-user aggregate plus the pending-job
//! claim table the refiller feeds from.
//!
//! The aggregate is one `user_aggregates` row per user with a JSONB `content`
//! column mapping correlation_id to the application record. Every mutation is
//! a field-path-scoped, conditional SQL update (`jsonb_set` + `WHERE` guard).
//! Whole-document read-modify-write is deliberately impossible through this
//! interface: it would clobber concurrent writes to sibling applications.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::errors::StoreError;
use crate::models::application::{ApplicationRecord, ApplicationStatus};

/// Result of the merge consumer's insert. `AlreadyPresent` signals a
/// duplicate delivery; the write was a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// Result of a status transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The record is already at the requested status (duplicate notification).
    AlreadyApplied,
    /// No record under this user/correlation id.
    NotFound,
    /// Regression or transition out of a terminal state.
    Invalid { current: ApplicationStatus },
    /// A concurrent writer moved the status between our read and the
    /// compare-and-set. Transient; the caller retries.
    Conflict,
}

/// A job claimed for dispatch by the refiller.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub correlation_id: String,
    pub user_id: String,
    pub job_context: Value,
}

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    /// Insert a freshly merged record at `content.<correlation_id>`.
    /// Idempotent: a record already present under that id leaves the
    /// aggregate untouched and reports `AlreadyPresent`.
    async fn insert_generated(
        &self,
        user_id: &str,
        record: &ApplicationRecord,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Advance a record's status via compare-and-set on its current status.
    /// Entering `sent` also raises the `sent` flag.
    async fn apply_status(
        &self,
        user_id: &str,
        correlation_id: &str,
        new_status: ApplicationStatus,
        reason: Option<&str>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Field-scoped read of a single record.
    async fn get_record(
        &self,
        user_id: &str,
        correlation_id: &str,
    ) -> Result<Option<ApplicationRecord>, StoreError>;

    /// Atomically claim up to `limit` undispatched jobs. Two overlapping
    /// refill cycles can never claim the same job.
    async fn claim_batch(&self, limit: i64) -> Result<Vec<ClaimedJob>, StoreError>;

    /// Return a claimed job to the unclaimed pool after a publish failure so
    /// the next cycle retries it.
    async fn release_claim(&self, correlation_id: &str) -> Result<(), StoreError>;
}

pub struct PgApplicationStore {
    pool: PgPool,
}

impl PgApplicationStore {
    pub fn new(pool: PgPool) -> Self {
        PgApplicationStore { pool }
    }

    async fn current_status(
        &self,
        user_id: &str,
        correlation_id: &str,
    ) -> Result<Option<ApplicationStatus>, StoreError> {
        let row = sqlx::query(
            "SELECT content #>> ARRAY[$2, 'status'] AS status
             FROM user_aggregates
             WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;

        let raw: Option<String> = match row {
            Some(row) => row.try_get("status")?,
            None => return Ok(None),
        };
        let raw = match raw {
            Some(raw) => raw,
            None => return Ok(None), // aggregate exists, record does not
        };

        ApplicationStatus::parse(&raw).map(Some).ok_or_else(|| {
            StoreError::Backend(format!(
                "record '{correlation_id}' carries unknown status '{raw}'"
            ))
        })
    }
}

#[async_trait]
impl ApplicationStore for PgApplicationStore {
    async fn insert_generated(
        &self,
        user_id: &str,
        record: &ApplicationRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        let body = serde_json::to_value(record)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        // The DO UPDATE guard makes redelivery a no-op: an existing record
        // under this correlation id is never overlaid.
        let result = sqlx::query(
            "INSERT INTO user_aggregates (user_id, content)
             VALUES ($1, jsonb_build_object($2::text, $3::jsonb))
             ON CONFLICT (user_id) DO UPDATE
             SET content = jsonb_set(user_aggregates.content, ARRAY[$2], $3::jsonb, true)
             WHERE NOT user_aggregates.content ? $2",
        )
        .bind(user_id)
        .bind(&record.correlation_id)
        .bind(&body)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                user_id,
                correlation_id = %record.correlation_id,
                "record already present, insert skipped"
            );
            Ok(UpsertOutcome::AlreadyPresent)
        } else {
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
        let current = match self.current_status(user_id, correlation_id).await? {
            Some(current) => current,
            None => return Ok(TransitionOutcome::NotFound),
        };

        if current == new_status {
            return Ok(TransitionOutcome::AlreadyApplied);
        }
        if !current.can_advance_to(new_status) {
            return Ok(TransitionOutcome::Invalid { current });
        }

        let raise_sent = new_status == ApplicationStatus::Sent;

        // Compare-and-set keyed on the status we just read. COALESCE guards
        // keep jsonb_set total: a NULL new-value would null the whole column.
        let result = sqlx::query(
            "UPDATE user_aggregates
             SET content = jsonb_set(jsonb_set(jsonb_set(jsonb_set(content,
                     ARRAY[$2, 'status'], to_jsonb($3::text)),
                     ARRAY[$2, 'sent'],
                     CASE WHEN $4 THEN 'true'::jsonb
                          ELSE COALESCE(content #> ARRAY[$2, 'sent'], 'false'::jsonb) END),
                     ARRAY[$2, 'reason'],
                     COALESCE(to_jsonb($5::text), content #> ARRAY[$2, 'reason'], 'null'::jsonb)),
                     ARRAY[$2, 'updated_at'], to_jsonb(now()))
             WHERE user_id = $1
               AND content #>> ARRAY[$2, 'status'] = $6",
        )
        .bind(user_id)
        .bind(correlation_id)
        .bind(new_status.as_str())
        .bind(raise_sent)
        .bind(reason)
        .bind(current.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(TransitionOutcome::Conflict);
        }

        debug!(user_id, correlation_id, from = %current, to = %new_status, "status advanced");
        Ok(TransitionOutcome::Applied)
    }

    async fn get_record(
        &self,
        user_id: &str,
        correlation_id: &str,
    ) -> Result<Option<ApplicationRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT content -> $2 AS record
             FROM user_aggregates
             WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;

        let value: Option<Value> = match row {
            Some(row) => row.try_get("record")?,
            None => return Ok(None),
        };

        match value {
            Some(value) => {
                let record = serde_json::from_value(value).map_err(|e| {
                    StoreError::Backend(format!(
                        "corrupted record '{correlation_id}' for user '{user_id}': {e}"
                    ))
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn claim_batch(&self, limit: i64) -> Result<Vec<ClaimedJob>, StoreError> {
        // SKIP LOCKED makes the select-and-mark a single atomic claim:
        // a row is visible to exactly one overlapping cycle.
        let rows = sqlx::query(
            "UPDATE pending_jobs
             SET dispatched = TRUE, claimed_at = now()
             WHERE correlation_id IN (
                 SELECT correlation_id FROM pending_jobs
                 WHERE dispatched = FALSE
                 ORDER BY created_at
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING correlation_id, user_id, job_context",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            claimed.push(ClaimedJob {
                correlation_id: row.try_get("correlation_id")?,
                user_id: row.try_get("user_id")?,
                job_context: row.try_get("job_context")?,
            });
        }
        Ok(claimed)
    }

    async fn release_claim(&self, correlation_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE pending_jobs
             SET dispatched = FALSE, claimed_at = NULL
             WHERE correlation_id = $1",
        )
        .bind(correlation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
