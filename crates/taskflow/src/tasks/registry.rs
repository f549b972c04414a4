use serde::{Deserialize, Serialize};

use crate::handlers::Handler;
use crate::tasks::error::DispatchError;
use crate::tasks::model::{Affects, TaskArgs};

/// Public, user-visible task types. The diagnostic ones only resolve when
/// the registry is built with diagnostics enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    DuplicateSubtree,
    ExportChannel,
    SyncChannel,
    Echo,
    AlwaysFails,
    ReportProgress,
}

impl TaskType {
    pub const PUBLIC: [TaskType; 3] = [
        TaskType::DuplicateSubtree,
        TaskType::ExportChannel,
        TaskType::SyncChannel,
    ];

    pub const DIAGNOSTIC: [TaskType; 3] = [
        TaskType::Echo,
        TaskType::AlwaysFails,
        TaskType::ReportProgress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::DuplicateSubtree => "duplicate-subtree",
            TaskType::ExportChannel => "export-channel",
            TaskType::SyncChannel => "sync-channel",
            TaskType::Echo => "echo",
            TaskType::AlwaysFails => "always-fails",
            TaskType::ReportProgress => "report-progress",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "duplicate-subtree" => Some(Self::DuplicateSubtree),
            "export-channel" => Some(Self::ExportChannel),
            "sync-channel" => Some(Self::SyncChannel),
            "echo" => Some(Self::Echo),
            "always-fails" => Some(Self::AlwaysFails),
            "report-progress" => Some(Self::ReportProgress),
            _ => None,
        }
    }

    pub fn is_diagnostic(&self) -> bool {
        Self::DIAGNOSTIC.contains(self)
    }

    fn entry(self) -> RegistryEntry {
        let (handler, is_progress_tracking, affects): (_, _, fn(&TaskArgs) -> Affects) = match self {
            TaskType::DuplicateSubtree => (Handler::DuplicateNodes, true, Affects::copy_target),
            TaskType::ExportChannel => (Handler::ExportChannel, true, Affects::channel_only),
            TaskType::SyncChannel => (Handler::SyncChannel, true, Affects::channel_only),
            // echo mirrors whatever it is given
            TaskType::Echo => (Handler::Echo, false, Affects::from_channel_and_nodes),
            TaskType::AlwaysFails => (Handler::AlwaysFails, false, Affects::none),
            TaskType::ReportProgress => (Handler::ReportProgress, true, Affects::none),
        };
        RegistryEntry {
            task_type: self,
            handler,
            is_progress_tracking,
            affects,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy)]
pub struct RegistryEntry {
    pub task_type: TaskType,
    pub handler: Handler,
    pub is_progress_tracking: bool,
    /// Derives `metadata.affects` from the job arguments.
    pub affects: fn(&TaskArgs) -> Affects,
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("task_type", &self.task_type)
            .field("handler", &self.handler)
            .field("is_progress_tracking", &self.is_progress_tracking)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskRegistry {
    diagnostics: bool,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self { diagnostics: false }
    }

    pub fn with_diagnostics() -> Self {
        Self { diagnostics: true }
    }

    pub fn from_flag(diagnostics: bool) -> Self {
        Self { diagnostics }
    }

    pub fn lookup(&self, name: &str) -> Result<RegistryEntry, DispatchError> {
        match TaskType::parse(name) {
            Some(t) if !t.is_diagnostic() || self.diagnostics => Ok(t.entry()),
            _ => Err(DispatchError::NotRegistered(name.to_string())),
        }
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types = TaskType::PUBLIC.to_vec();
        if self.diagnostics {
            types.extend(TaskType::DIAGNOSTIC);
        }
        types
    }
}
