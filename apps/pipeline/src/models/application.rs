//! Application record and its status lifecycle.
//!
//! Statuses move forward only: `generated → pending_review → sent →
//! {submitted, failed}`. No component may regress a status; terminal states
//! accept nothing further. Duplicate transitions are treated as no-ops by the
//! store, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Generated,
    PendingReview,
    Sent,
    Submitted,
    Failed,
}

impl ApplicationStatus {
    /// Position along the lifecycle. `Submitted` and `Failed` share a rank:
    /// they are alternative terminal outcomes, not steps past each other.
    fn rank(self) -> u8 {
        match self {
            ApplicationStatus::Generated => 0,
            ApplicationStatus::PendingReview => 1,
            ApplicationStatus::Sent => 2,
            ApplicationStatus::Submitted | ApplicationStatus::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ApplicationStatus::Submitted | ApplicationStatus::Failed)
    }

    /// Whether `next` is a permitted forward transition from `self`.
    pub fn can_advance_to(self, next: ApplicationStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApplicationStatus::Generated => "generated",
            ApplicationStatus::PendingReview => "pending_review",
            ApplicationStatus::Sent => "sent",
            ApplicationStatus::Submitted => "submitted",
            ApplicationStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "generated" => Some(ApplicationStatus::Generated),
            "pending_review" => Some(ApplicationStatus::PendingReview),
            "sent" => Some(ApplicationStatus::Sent),
            "submitted" => Some(ApplicationStatus::Submitted),
            "failed" => Some(ApplicationStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One application inside a user's aggregate document, stored under
/// `content.<correlation_id>`. Created exactly once by the merge consumer;
/// mutated afterwards only through field-scoped status updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub correlation_id: String,
    pub job_context: Value,
    pub resume: Value,
    pub cover_letter: Value,
    pub status: ApplicationStatus,
    pub sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApplicationRecord {
    /// A freshly merged record: cached job context reunited with the
    /// AI-generated documents, awaiting review.
    pub fn generated(
        correlation_id: String,
        job_context: Value,
        resume: Value,
        cover_letter: Value,
    ) -> Self {
        let now = Utc::now();
        ApplicationRecord {
            correlation_id,
            job_context,
            resume,
            cover_letter,
            status: ApplicationStatus::Generated,
            sent: false,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}
