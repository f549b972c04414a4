use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::handlers::Handler;
use crate::tasks::backend::{ExecutionBackend, Submission, SubmissionHandle};
use crate::tasks::error::DispatchError;
use crate::tasks::model::{
    NewTaskRecord, TaskArgs, TaskMetadata, TaskRecord, User, SUBMISSION_FAILURE_MESSAGE,
};
use crate::tasks::registry::TaskRegistry;
use crate::tasks::repo::TaskStore;
use crate::tasks::status::TaskStatus;

#[derive(Debug, Clone, Serialize)]
pub struct DispatchedTask {
    pub handle: SubmissionHandle,
    pub record: TaskRecord,
}

/// Front door for user-visible background work.
///
/// One call creates exactly one task record and makes at most one
/// submission attempt. The dispatcher writes the record only when creating
/// it and when the submission is refused; every later write belongs to the
/// runner executing the handler.
#[derive(Clone)]
pub struct Dispatcher {
    registry: TaskRegistry,
    store: Arc<dyn TaskStore>,
    backend: Arc<dyn ExecutionBackend>,
}

impl Dispatcher {
    pub fn new(
        registry: TaskRegistry,
        store: Arc<dyn TaskStore>,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Self {
        Self {
            registry,
            store,
            backend,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub async fn create_async_task(
        &self,
        task_type: &str,
        user: Option<&User>,
        args: TaskArgs,
    ) -> Result<DispatchedTask, DispatchError> {
        self.create_task(task_type, user, args, false).await
    }

    /// Same as [`Dispatcher::create_task`] for callers holding only an id.
    /// An id with no matching user is `UnknownOwner`, never `MissingOwner`.
    pub async fn create_task_for(
        &self,
        task_type: &str,
        user_id: Option<Uuid>,
        args: TaskArgs,
        synchronous: bool,
    ) -> Result<DispatchedTask, DispatchError> {
        let user = match user_id {
            Some(id) => Some(
                self.store
                    .get_user(id)
                    .await?
                    .ok_or(DispatchError::UnknownOwner(id))?,
            ),
            None => None,
        };
        self.create_task(task_type, user.as_ref(), args, synchronous)
            .await
    }

    /// Validate, record, submit, and reconcile the record if the backend
    /// refused the submission.
    ///
    /// A refused submission is not an error here: the record is forced to
    /// FAILURE and returned so a polling client sees it.
    pub async fn create_task(
        &self,
        task_type: &str,
        user: Option<&User>,
        args: TaskArgs,
        synchronous: bool,
    ) -> Result<DispatchedTask, DispatchError> {
        let entry = self.registry.lookup(task_type)?;
        let user = user.ok_or(DispatchError::MissingOwner)?;
        if !self.store.user_exists(user.id).await? {
            return Err(DispatchError::UnknownOwner(user.id));
        }

        let metadata = TaskMetadata::new((entry.affects)(&args));
        let mut record = self
            .store
            .create(NewTaskRecord {
                task_type: entry.task_type,
                is_progress_tracking: entry.is_progress_tracking,
                user_id: user.id,
                metadata,
            })
            .await?;

        let handle = self
            .backend
            .submit(Submission {
                job_id: record.task_id,
                handler: entry.handler,
                owner: Some(user.id),
                args,
                synchronous,
            })
            .await;

        if synchronous {
            self.store.refresh(&mut record).await?;
        }

        let error = handle
            .error
            .as_ref()
            .map(|e| e.message.as_str())
            .unwrap_or("");
        if handle.is_failure() && synchronous && record.status == TaskStatus::Failure {
            // ran inline and the handler failed; the runner already wrote it
            tracing::warn!(
                task_id = %record.task_id,
                task_type = %entry.task_type,
                error,
                "synchronous task failed"
            );
        } else if handle.is_failure() {
            tracing::error!(
                task_id = %record.task_id,
                task_type = %entry.task_type,
                error,
                "task submission failed"
            );
            // The backend's failure path may already have written error
            // details, so the store merges rather than overwrites.
            if let Some(fresh) = self
                .store
                .fail_submission(record.task_id, SUBMISSION_FAILURE_MESSAGE)
                .await?
            {
                record = fresh;
            }
        } else if !synchronous {
            tracing::debug!(task_id = %record.task_id, task_type = %entry.task_type, "task queued");
        }

        Ok(DispatchedTask { handle, record })
    }

    /// Submit maintenance work that has no user-visible record.
    pub async fn enqueue_untracked(
        &self,
        handler: Handler,
        owner: Option<Uuid>,
        args: TaskArgs,
    ) -> SubmissionHandle {
        let handle = self
            .backend
            .submit(Submission {
                job_id: Uuid::new_v4(),
                handler,
                owner,
                args,
                synchronous: false,
            })
            .await;
        if handle.is_failure() {
            tracing::error!(
                job_id = %handle.job_id,
                %handler,
                error = handle.error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
                "untracked job submission failed"
            );
        }
        handle
    }
}
