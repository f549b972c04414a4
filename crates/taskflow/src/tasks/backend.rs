use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::handlers::{Handler, TaskResult};
use crate::tasks::model::{TaskArgs, TaskErrorInfo};
use crate::tasks::runner::RunOutcome;

/// What the backend knew right after the submit call returned. For an
/// enqueue that is only whether the enqueue itself worked; it says nothing
/// about how the job will end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Pending,
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct Submission {
    /// Always the task record's id so the two stay correlated.
    pub job_id: Uuid,
    pub handler: Handler,
    pub owner: Option<Uuid>,
    pub args: TaskArgs,
    pub synchronous: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionHandle {
    pub job_id: Uuid,
    pub immediate_status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl SubmissionHandle {
    pub fn pending(job_id: Uuid) -> Self {
        Self {
            job_id,
            immediate_status: SubmissionStatus::Pending,
            error: None,
            result: None,
        }
    }

    pub fn failed(job_id: Uuid, error: TaskErrorInfo) -> Self {
        Self {
            job_id,
            immediate_status: SubmissionStatus::Failure,
            error: Some(error),
            result: None,
        }
    }

    /// Handle for a submission that ran inline.
    pub fn from_outcome(job_id: Uuid, outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Succeeded(result) => Self {
                job_id,
                immediate_status: SubmissionStatus::Success,
                error: None,
                result,
            },
            RunOutcome::Failed(error) => Self::failed(job_id, error),
            // a record already finished by an earlier delivery
            RunOutcome::Skipped(_) => Self {
                job_id,
                immediate_status: SubmissionStatus::Success,
                error: None,
                result: None,
            },
        }
    }

    pub fn is_failure(&self) -> bool {
        self.immediate_status == SubmissionStatus::Failure
    }
}

/// Runs handlers somewhere else. `submit` never errors: a refused
/// submission comes back as a [`SubmissionStatus::Failure`] handle.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn submit(&self, submission: Submission) -> SubmissionHandle;
}

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Submit-time payload check shared by the backends.
#[derive(Debug, Clone, Copy)]
pub struct PayloadGuard {
    max_payload_bytes: usize,
}

impl Default for PayloadGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_BYTES)
    }
}

impl PayloadGuard {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes }
    }

    pub fn check(&self, args: &TaskArgs) -> anyhow::Result<usize> {
        let payload_bytes = serde_json::to_vec(args)?.len();
        if payload_bytes > self.max_payload_bytes {
            anyhow::bail!(
                "PAYLOAD_TOO_LARGE: {payload_bytes} bytes exceeds the {} byte limit",
                self.max_payload_bytes
            );
        }
        Ok(payload_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn oversized_payloads_are_refused() {
        let guard = PayloadGuard::new(16);
        let small = json!({"a": 1}).as_object().cloned().unwrap();
        let big = json!({"a": "x".repeat(64)}).as_object().cloned().unwrap();

        assert!(guard.check(&small).is_ok());
        let err = guard.check(&big).unwrap_err();
        assert!(err.to_string().contains("PAYLOAD_TOO_LARGE"));
    }

    #[test]
    fn inline_failure_keeps_the_handler_error() {
        let id = Uuid::new_v4();
        let handle = SubmissionHandle::from_outcome(id, RunOutcome::Failed(TaskErrorInfo::new("boom")));
        assert!(handle.is_failure());
        assert_eq!(handle.error.unwrap().message, "boom");
    }
}
