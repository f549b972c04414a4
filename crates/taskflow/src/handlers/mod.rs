//! Job bodies the execution backend can run.
//!
//! A handler gets the owning user (if any), its JSON arguments and a
//! [`TaskContext`] for progress. It returns nothing or a [`TaskResult`]
//! whose change events a live client applies optimistically.

pub mod cache;
pub mod changes;
pub mod channels;
pub mod diagnostics;
pub mod exports;
pub mod nodes;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::content::{ContentError, Services};
use crate::tasks::model::TaskArgs;
use crate::tasks::repo::TaskStore;

pub use changes::{ChangeEvent, ResourceKind, COPYING_FLAG};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Handler {
    DuplicateNodes,
    ExportChannel,
    SyncChannel,
    GenerateChannelCsv,
    GenerateUserCsv,
    DeleteTree,
    FetchNodeDetails,
    CacheChannelMetadata,
    CacheChannelsMetadata,
    CacheUsersMetadata,
    Echo,
    AlwaysFails,
    ReportProgress,
}

impl Handler {
    pub const ALL: [Handler; 13] = [
        Handler::DuplicateNodes,
        Handler::ExportChannel,
        Handler::SyncChannel,
        Handler::GenerateChannelCsv,
        Handler::GenerateUserCsv,
        Handler::DeleteTree,
        Handler::FetchNodeDetails,
        Handler::CacheChannelMetadata,
        Handler::CacheChannelsMetadata,
        Handler::CacheUsersMetadata,
        Handler::Echo,
        Handler::AlwaysFails,
        Handler::ReportProgress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Handler::DuplicateNodes => "duplicate_nodes",
            Handler::ExportChannel => "export_channel",
            Handler::SyncChannel => "sync_channel",
            Handler::GenerateChannelCsv => "generate_channel_csv",
            Handler::GenerateUserCsv => "generate_user_csv",
            Handler::DeleteTree => "delete_tree",
            Handler::FetchNodeDetails => "fetch_node_details",
            Handler::CacheChannelMetadata => "cache_channel_metadata",
            Handler::CacheChannelsMetadata => "cache_channels_metadata",
            Handler::CacheUsersMetadata => "cache_users_metadata",
            Handler::Echo => "echo",
            Handler::AlwaysFails => "always_fails",
            Handler::ReportProgress => "report_progress",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|h| h.as_str() == s)
    }
}

impl std::fmt::Display for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid arguments: {0}")]
    BadArguments(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("node {id} already exists and is not a copy of {source_id}")]
    IdentifierConflict { id: String, source_id: String },

    #[error("{0}")]
    Simulated(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ContentError> for HandlerError {
    fn from(err: ContentError) -> Self {
        match err {
            ContentError::NotFound { entity, id } => HandlerError::NotFound { entity, id },
            ContentError::Invalid(msg) => HandlerError::BadArguments(msg),
            other => HandlerError::Internal(other.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub changes: Vec<ChangeEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TaskResult {
    pub fn changes(changes: Vec<ChangeEvent>) -> Self {
        Self {
            changes,
            data: None,
        }
    }

    pub fn data(data: Value) -> Self {
        Self {
            changes: Vec::new(),
            data: Some(data),
        }
    }
}

/// What a running handler may see of its own job.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub owner: Option<Uuid>,
    pub services: Services,
    store: Arc<dyn TaskStore>,
}

impl TaskContext {
    pub fn new(
        task_id: Uuid,
        owner: Option<Uuid>,
        services: Services,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            task_id,
            owner,
            services,
            store,
        }
    }

    /// Best effort: a lost progress write never fails the job.
    pub async fn report_progress(&self, progress: f64) {
        if let Err(e) = self.store.update_progress(self.task_id, progress).await {
            tracing::warn!(task_id = %self.task_id, error = %e, "progress update failed");
        }
    }

    /// The acting user: the job owner, or a `user_id` argument for jobs
    /// submitted without one.
    pub fn acting_user(&self, user_id: Option<Uuid>) -> Result<Uuid, HandlerError> {
        self.owner
            .or(user_id)
            .ok_or_else(|| HandlerError::BadArguments("user_id is required".into()))
    }
}

pub fn parse_args<T: DeserializeOwned>(args: TaskArgs) -> Result<T, HandlerError> {
    serde_json::from_value(Value::Object(args)).map_err(|e| HandlerError::BadArguments(e.to_string()))
}

pub async fn run(
    handler: Handler,
    ctx: &TaskContext,
    args: TaskArgs,
) -> Result<Option<TaskResult>, HandlerError> {
    match handler {
        Handler::DuplicateNodes => nodes::duplicate_nodes(ctx, parse_args(args)?).await.map(Some),
        Handler::ExportChannel => channels::export_channel(ctx, parse_args(args)?).await.map(Some),
        Handler::SyncChannel => channels::sync_channel(ctx, parse_args(args)?).await.map(|_| None),
        Handler::GenerateChannelCsv => {
            exports::generate_channel_csv(ctx, parse_args(args)?).await.map(|_| None)
        }
        Handler::GenerateUserCsv => {
            exports::generate_user_csv(ctx, parse_args(args)?).await.map(|_| None)
        }
        Handler::DeleteTree => nodes::delete_tree(ctx, parse_args(args)?).await.map(|_| None),
        Handler::FetchNodeDetails => {
            nodes::fetch_node_details(ctx, parse_args(args)?).await.map(Some)
        }
        Handler::CacheChannelMetadata => {
            cache::cache_channel_metadata(ctx, parse_args(args)?).await.map(|_| None)
        }
        Handler::CacheChannelsMetadata => {
            cache::cache_channels_metadata(ctx, parse_args(args)?).await.map(|_| None)
        }
        Handler::CacheUsersMetadata => {
            cache::cache_users_metadata(ctx, parse_args(args)?).await.map(|_| None)
        }
        Handler::Echo => diagnostics::echo(args).await,
        Handler::AlwaysFails => diagnostics::always_fails().await.map(|_| None),
        Handler::ReportProgress => {
            diagnostics::report_progress(ctx, parse_args(args)?).await.map(|_| None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_names_are_unique_and_parse_back() {
        for h in Handler::ALL {
            assert_eq!(Handler::parse(h.as_str()), Some(h));
            assert_eq!(serde_json::to_value(h).unwrap(), serde_json::json!(h.as_str()));
        }
        assert_eq!(Handler::parse("duplicate-subtree"), None);
    }

    #[test]
    fn bad_arguments_are_reported_not_panicked() {
        let args = serde_json::json!({"tree_id": 7}).as_object().cloned().unwrap();
        let err = parse_args::<nodes::DeleteTreeArgs>(args).unwrap_err();
        assert!(matches!(err, HandlerError::BadArguments(_)));
    }
}
