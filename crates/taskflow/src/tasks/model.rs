use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::tasks::registry::TaskType;
use crate::tasks::status::TaskStatus;

/// Job arguments as they cross the backend boundary: plain JSON only.
pub type TaskArgs = Map<String, Value>;

pub const SUBMISSION_FAILURE_MESSAGE: &str =
    "Unknown error starting task. Please contact support.";

pub const HANDLER_FAILURE_MESSAGE: &str = "Task failed with an unknown error.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affects {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<String>>,
}

impl Affects {
    pub fn is_empty(&self) -> bool {
        self.channel.is_none() && self.nodes.is_none()
    }

    /// Reads `channel_id` and `node_ids` out of the job arguments. Values of
    /// the wrong shape are ignored; this annotates, it does not validate.
    pub fn from_channel_and_nodes(args: &TaskArgs) -> Self {
        let channel = args.get("channel_id").and_then(id_string);
        let nodes = args
            .get("node_ids")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(id_string).collect());
        Self { channel, nodes }
    }

    /// Channel-wide jobs: the whole channel is in flux, no node list.
    pub fn channel_only(args: &TaskArgs) -> Self {
        Self {
            channel: args.get("channel_id").and_then(id_string),
            nodes: None,
        }
    }

    /// A subtree copy touches the node it creates, named by `pk`.
    pub fn copy_target(args: &TaskArgs) -> Self {
        let mut affects = Self::from_channel_and_nodes(args);
        if let Some(pk) = args.get("pk").and_then(id_string) {
            affects.nodes.get_or_insert_with(Vec::new).push(pk);
        }
        affects
    }

    pub fn none(_args: &TaskArgs) -> Self {
        Self::default()
    }
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskErrorInfo {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl TaskErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn has_message(&self) -> bool {
        !self.message.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub affects: Affects,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl TaskMetadata {
    pub fn new(affects: Affects) -> Self {
        Self {
            affects,
            error: None,
            result: None,
        }
    }

    /// Attach a failure. An earlier, more specific message wins over
    /// `fallback`; a traceback already present is kept unless `error`
    /// brings its own.
    pub fn merge_error(&mut self, error: Option<TaskErrorInfo>, fallback: &str) {
        let current = self.error.take().unwrap_or_default();
        let incoming = error.unwrap_or_default();

        let message = if current.has_message() {
            current.message
        } else if incoming.has_message() {
            incoming.message
        } else {
            fallback.to_string()
        };

        self.error = Some(TaskErrorInfo {
            message,
            traceback: incoming.traceback.or(current.traceback),
        });
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error
            .as_ref()
            .filter(|e| e.has_message())
            .map(|e| e.message.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub is_progress_tracking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    pub user_id: Uuid,
    pub metadata: TaskMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTaskRecord {
    pub task_type: TaskType,
    pub is_progress_tracking: bool,
    pub user_id: Uuid,
    pub metadata: TaskMetadata,
}

pub fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        return 0.0;
    }
    progress.clamp(0.0, 100.0)
}
