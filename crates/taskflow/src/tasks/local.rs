use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::tasks::backend::{ExecutionBackend, PayloadGuard, Submission, SubmissionHandle};
use crate::tasks::model::TaskErrorInfo;
use crate::tasks::runner::TaskRunner;

/// In-process backend: every submission runs on its own tokio task.
pub struct LocalBackend {
    runner: TaskRunner,
    guard: PayloadGuard,
    inflight: Mutex<JoinSet<()>>,
}

impl LocalBackend {
    pub fn new(runner: TaskRunner) -> Self {
        Self::with_guard(runner, PayloadGuard::default())
    }

    pub fn with_guard(runner: TaskRunner, guard: PayloadGuard) -> Self {
        Self {
            runner,
            guard,
            inflight: Mutex::new(JoinSet::new()),
        }
    }

    /// Wait until every job submitted so far has finished.
    pub async fn wait_idle(&self) {
        loop {
            let mut set = std::mem::take(&mut *self.inflight.lock().await);
            if set.is_empty() {
                return;
            }
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "local job task aborted");
                }
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    async fn submit(&self, submission: Submission) -> SubmissionHandle {
        let Submission {
            job_id,
            handler,
            owner,
            args,
            synchronous,
        } = submission;

        if let Err(e) = self.guard.check(&args) {
            return SubmissionHandle::failed(job_id, TaskErrorInfo::new(e.to_string()));
        }

        if synchronous {
            let outcome = self.runner.run(job_id, handler, owner, args).await;
            return SubmissionHandle::from_outcome(job_id, outcome);
        }

        let runner = self.runner.clone();
        self.inflight.lock().await.spawn(async move {
            runner.run(job_id, handler, owner, args).await;
        });
        SubmissionHandle::pending(job_id)
    }
}
