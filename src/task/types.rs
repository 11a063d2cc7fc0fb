use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::runtime::ids::{ServerId, TaskId};

/// Task lifecycle status. Serialized uppercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Timeout => "TIMEOUT",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

/// What a client submits. The payload is opaque; the gateway only forwards
/// it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub priority: u8,
    pub payload: Value,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, rename = "async")]
    pub is_async: bool,
}

impl TaskRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.task_type.trim().is_empty() {
            return Err(ApiError::Validation("task type must not be empty".into()));
        }
        if self.priority > 10 {
            return Err(ApiError::Validation(
                "priority must be between 0 and 10".into(),
            ));
        }
        Ok(())
    }
}

/// Record of one prior dispatch attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAttempt {
    pub attempt: u32,
    pub started_at: u64,
    pub previous_status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_error: Option<String>,
}

/// The task document: stored, mutated through the lifecycle, and returned
/// (as-is) as the status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub request: TaskRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub progress: u8,
    pub created_at: u64,
    pub updated_at: u64,
    pub attempts: Vec<TaskAttempt>,
}

/// Lifecycle update delivered by a worker callback or the synchronous
/// response path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Result envelope for retry/cancel operations.
#[derive(Debug, Serialize)]
pub struct LifecycleResponse {
    pub success: bool,
    pub message: String,
}
