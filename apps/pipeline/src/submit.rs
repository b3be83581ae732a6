#![allow(dead_code)]

//! Submission publisher.
//!
//! Called by the surrounding edit/browse layer when a user submits reviewed
//! applications. Each application goes out as its own single-application
//! document, and only then is its status CAS-advanced to `sent` so a publish
//! failure never strands a record in `sent` without a message on the queue.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::errors::StoreError;
use crate::models::application::ApplicationStatus;
use crate::queue::QueuePublisher;
use crate::store::{ApplicationStore, TransitionOutcome};

/// Why an application was not submitted. Reported back to the caller,
/// never silently swallowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    NotReviewable { current: ApplicationStatus },
    PublishFailed(String),
    TransitionConflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSubmission {
    pub correlation_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Default)]
pub struct SubmitReport {
    pub submitted: Vec<String>,
    pub skipped: Vec<SkippedSubmission>,
}

pub struct SubmissionPublisher {
    store: Arc<dyn ApplicationStore>,
    publisher: Arc<dyn QueuePublisher>,
}

impl SubmissionPublisher {
    pub fn new(store: Arc<dyn ApplicationStore>, publisher: Arc<dyn QueuePublisher>) -> Self {
        SubmissionPublisher { store, publisher }
    }

    /// Submit the given applications for `user_id`. Only records currently in
    /// `pending_review` are eligible; everything else lands in the report's
    /// skip list with a reason.
    pub async fn submit(
        &self,
        user_id: &str,
        correlation_ids: &[String],
    ) -> Result<SubmitReport, StoreError> {
        let mut report = SubmitReport::default();

        for correlation_id in correlation_ids {
            match self.submit_one(user_id, correlation_id).await? {
                None => report.submitted.push(correlation_id.clone()),
                Some(reason) => {
                    warn!(
                        user_id,
                        correlation_id,
                        reason = ?reason,
                        "application skipped during submission"
                    );
                    report.skipped.push(SkippedSubmission {
                        correlation_id: correlation_id.clone(),
                        reason,
                    });
                }
            }
        }

        info!(
            user_id,
            submitted = report.submitted.len(),
            skipped = report.skipped.len(),
            "submission batch published"
        );
        Ok(report)
    }

    async fn submit_one(
        &self,
        user_id: &str,
        correlation_id: &str,
    ) -> Result<Option<SkipReason>, StoreError> {
        let record = match self.store.get_record(user_id, correlation_id).await? {
            Some(record) => record,
            None => return Ok(Some(SkipReason::NotFound)),
        };
        if record.status != ApplicationStatus::PendingReview {
            return Ok(Some(SkipReason::NotReviewable {
                current: record.status,
            }));
        }

        let document = json!({
            "user_id": user_id,
            "content": { correlation_id: record },
        });
        if let Err(e) = self.publisher.publish(&document).await {
            return Ok(Some(SkipReason::PublishFailed(e.to_string())));
        }

        match self
            .store
            .apply_status(user_id, correlation_id, ApplicationStatus::Sent, None)
            .await?
        {
            TransitionOutcome::Applied | TransitionOutcome::AlreadyApplied => Ok(None),
            // The record moved between our read and the CAS. The message is
            // out; report the conflict so the caller can reconcile.
            _ => Ok(Some(SkipReason::TransitionConflict)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::application::ApplicationRecord;
    use crate::testing::{CapturePublisher, MemoryStore};
    use serde_json::json;

    async fn seed(store: &MemoryStore, correlation_id: &str, status: ApplicationStatus) {
        let mut record = ApplicationRecord::generated(
            correlation_id.to_string(),
            json!({"title": "Engineer"}),
            json!({}),
            json!({}),
        );
        record.status = status;
        store.seed_record("u1", record).await;
    }

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_submission_publishes_and_advances_to_sent() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(CapturePublisher::new("application_submit"));
        seed(&store, "abc", ApplicationStatus::PendingReview).await;

        let report = SubmissionPublisher::new(store.clone(), publisher.clone())
            .submit("u1", &ids(&["abc"]))
            .await
            .unwrap();

        assert_eq!(report.submitted, vec!["abc".to_string()]);
        assert!(report.skipped.is_empty());

        let record = store.record("u1", "abc").await.unwrap();
        assert_eq!(record.status, ApplicationStatus::Sent);
        assert!(record.sent);

        let messages = publisher.published().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["user_id"], json!("u1"));
        assert!(messages[0]["content"]["abc"].is_object());
    }

    #[tokio::test]
    async fn test_only_pending_review_records_are_eligible() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(CapturePublisher::new("application_submit"));
        seed(&store, "fresh", ApplicationStatus::Generated).await;
        seed(&store, "gone", ApplicationStatus::Sent).await;

        let report = SubmissionPublisher::new(store.clone(), publisher.clone())
            .submit("u1", &ids(&["fresh", "gone", "missing"]))
            .await
            .unwrap();

        assert!(report.submitted.is_empty());
        assert_eq!(report.skipped.len(), 3);
        assert!(publisher.published().await.is_empty());
        assert_eq!(
            report.skipped[2].reason,
            SkipReason::NotFound
        );
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_status_untouched() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(CapturePublisher::new("application_submit"));
        seed(&store, "abc", ApplicationStatus::PendingReview).await;
        publisher.fail_for("abc").await;

        let report = SubmissionPublisher::new(store.clone(), publisher)
            .submit("u1", &ids(&["abc"]))
            .await
            .unwrap();

        assert!(report.submitted.is_empty());
        assert!(matches!(
            report.skipped[0].reason,
            SkipReason::PublishFailed(_)
        ));
        assert_eq!(
            store.record("u1", "abc").await.unwrap().status,
            ApplicationStatus::PendingReview
        );
    }
}
