use std::any::Any;
use std::sync::Arc;

use tokio::task::JoinError;
use uuid::Uuid;

use crate::content::Services;
use crate::handlers::{self, Handler, TaskContext, TaskResult};
use crate::tasks::model::{TaskArgs, TaskErrorInfo};
use crate::tasks::repo::TaskStore;
use crate::tasks::status::TaskStatus;

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Succeeded(Option<TaskResult>),
    Failed(TaskErrorInfo),
    /// The record was already terminal; this was a duplicate delivery.
    Skipped(TaskStatus),
}

impl RunOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failed(_))
    }
}

/// Executes one delivery of a job and owns every record write after
/// QUEUED. Used by both backends.
#[derive(Clone)]
pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    services: Services,
}

impl TaskRunner {
    pub fn new(store: Arc<dyn TaskStore>, services: Services) -> Self {
        Self { store, services }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub async fn run(
        &self,
        job_id: Uuid,
        handler: Handler,
        owner: Option<Uuid>,
        args: TaskArgs,
    ) -> RunOutcome {
        // Untracked maintenance jobs have no record at all.
        let tracked = match self.store.get(job_id).await {
            Ok(Some(record)) if record.status.is_terminal() => {
                tracing::info!(task_id = %job_id, status = %record.status, "task already finished, skipping");
                return RunOutcome::Skipped(record.status);
            }
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(task_id = %job_id, error = %e, "could not read task record");
                true
            }
        };

        if tracked {
            match self.store.mark_started(job_id).await {
                Ok(true) => {}
                Ok(false) => tracing::debug!(task_id = %job_id, "task was already started"),
                Err(e) => tracing::warn!(task_id = %job_id, error = %e, "mark_started failed"),
            }
        }

        tracing::info!(task_id = %job_id, %handler, "task started");

        let ctx = TaskContext::new(job_id, owner, self.services.clone(), self.store.clone());
        let joined = tokio::spawn(async move { handlers::run(handler, &ctx, args).await }).await;

        let outcome = match joined {
            Ok(Ok(result)) => RunOutcome::Succeeded(result),
            Ok(Err(e)) => {
                RunOutcome::Failed(TaskErrorInfo::new(e.to_string()).with_traceback(format!("{e:?}")))
            }
            Err(e) => RunOutcome::Failed(join_failure(e)),
        };

        match &outcome {
            RunOutcome::Succeeded(_) => tracing::info!(task_id = %job_id, %handler, "task succeeded"),
            RunOutcome::Failed(err) => {
                tracing::warn!(task_id = %job_id, %handler, error = %err.message, "task failed")
            }
            RunOutcome::Skipped(_) => {}
        }

        if tracked {
            self.record(job_id, &outcome).await;
        }
        outcome
    }

    async fn record(&self, job_id: Uuid, outcome: &RunOutcome) {
        let write = match outcome {
            RunOutcome::Succeeded(result) => {
                let value = match result.as_ref().map(serde_json::to_value).transpose() {
                    Ok(value) => value,
                    Err(e) => {
                        let err = TaskErrorInfo::new(format!("could not serialize task result: {e}"));
                        return self.log_write(job_id, self.store.mark_failed(job_id, err).await);
                    }
                };
                self.store.mark_succeeded(job_id, value).await
            }
            RunOutcome::Failed(err) => self.store.mark_failed(job_id, err.clone()).await,
            RunOutcome::Skipped(_) => return,
        };
        self.log_write(job_id, write);
    }

    fn log_write(&self, job_id: Uuid, write: anyhow::Result<bool>) {
        match write {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(task_id = %job_id, "final status not written, record already moved on")
            }
            Err(e) => tracing::error!(task_id = %job_id, error = %e, "could not record task outcome"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn join_failure(e: JoinError) -> TaskErrorInfo {
    if e.is_panic() {
        let payload = e.into_panic();
        TaskErrorInfo::new("task panicked").with_traceback(panic_message(payload.as_ref()))
    } else {
        TaskErrorInfo::new("task was cancelled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_text() {
        let payload: Box<dyn Any + Send> = Box::new("bad index");
        assert_eq!(panic_message(payload.as_ref()), "bad index");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
