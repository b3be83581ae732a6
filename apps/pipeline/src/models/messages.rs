//! Wire messages exchanged with the external AI and automation services.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::application::ApplicationStatus;

/// Published by the refiller to the generation queue. The same `job_context`
/// is written to the correlation cache before this message goes out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub correlation_id: String,
    pub user_id: String,
    pub job_context: Value,
}

/// Consumed from the response queue; the AI service echoes the
/// correlation id it received in the dispatch message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub correlation_id: String,
    pub user_id: String,
    pub resume: Value,
    pub cover_letter: Value,
}

/// Consumed from the status queue; emitted by the automation service when an
/// application progresses (submitted) or permanently fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub correlation_id: String,
    pub user_id: String,
    pub new_status: ApplicationStatus,
    #[serde(default)]
    pub reason: Option<String>,
}
