// crates/taskflow/src/tasks/queue.rs

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::handlers::Handler;
use crate::tasks::backend::{ExecutionBackend, PayloadGuard, Submission, SubmissionHandle};
use crate::tasks::model::{TaskArgs, TaskErrorInfo};
use crate::tasks::repo::TaskStore;
use crate::tasks::runner::{RunOutcome, TaskRunner};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedJob {
    pub id: Uuid,
    pub queue: String,
    pub handler: String,
    pub owner_id: Option<Uuid>,
    pub args_json: Value,
    pub status: String,

    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn handler(&self) -> anyhow::Result<Handler> {
        Handler::parse(&self.handler)
            .ok_or_else(|| anyhow::anyhow!("no handler named {}", self.handler))
    }

    pub fn args(&self) -> TaskArgs {
        match &self.args_json {
            Value::Object(map) => map.clone(),
            _ => TaskArgs::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewQueuedJob {
    pub id: Uuid,
    pub queue: String,
    pub handler: Handler,
    pub owner_id: Option<Uuid>,
    pub args_json: Value,
}

pub enum QueueStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Running => "running",
            QueueStatus::Succeeded => "succeeded",
            QueueStatus::Failed => "failed",
        }
    }
}

#[derive(Clone)]
pub struct QueueRepo {
    pool: PgPool,
}

impl QueueRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(&self, job: NewQueuedJob) -> anyhow::Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO task_queue (id, queue, handler, owner_id, args_json, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(job.id)
        .bind(&job.queue)
        .bind(job.handler.as_str())
        .bind(job.owner_id)
        .bind(&job.args_json)
        .bind(QueueStatus::Queued.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<QueuedJob>> {
        let job = sqlx::query_as::<_, QueuedJob>("SELECT * FROM task_queue WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// (queued, running, succeeded, failed)
    pub async fn counts(&self, queue: &str) -> anyhow::Result<(i64, i64, i64, i64)> {
        let row = sqlx::query_as::<_, (i64, i64, i64, i64)>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued'),
                COUNT(*) FILTER (WHERE status = 'running'),
                COUNT(*) FILTER (WHERE status = 'succeeded'),
                COUNT(*) FILTER (WHERE status = 'failed')
            FROM task_queue
            WHERE queue = $1
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    // ----------------------------
    // Leasing
    // ----------------------------

    pub async fn lease_one_job(
        &self,
        queue: &str,
        worker_id: &str,
        lease_seconds: i64,
    ) -> anyhow::Result<Option<QueuedJob>> {
        let mut tx = self.pool.begin().await?;

        // Lock the candidate so only one worker can lease it.
        let candidate: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM task_queue
            WHERE queue = $1
              AND status = $2
            ORDER BY created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(queue)
        .bind(QueueStatus::Queued.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_id) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let leased = sqlx::query_as::<_, QueuedJob>(
            r#"
            UPDATE task_queue
            SET status = $4,
                locked_by = $2,
                locked_at = now(),
                lock_expires_at = now() + ($3::int * interval '1 second'),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lease_seconds)
        .bind(QueueStatus::Running.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(leased))
    }

    // ----------------------------
    // Maintenance
    // ----------------------------

    /// Put jobs whose worker died back in the queue. They will run again,
    /// so handlers must tolerate a second delivery.
    pub async fn reap_expired_locks(&self) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = $1,
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE status = $2
              AND lock_expires_at IS NOT NULL
              AND lock_expires_at < now()
            "#,
        )
        .bind(QueueStatus::Queued.as_str())
        .bind(QueueStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    /// Push the lease deadline out while the holder is still working.
    /// Returns false once the lease has been reaped or taken over.
    pub async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_seconds: i64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE task_queue
            SET lock_expires_at = now() + ($3::int * interval '1 second'),
                updated_at = now()
            WHERE id = $1
              AND locked_by = $2
              AND status = $4
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lease_seconds)
        .bind(QueueStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    pub async fn mark_succeeded(&self, job_id: Uuid, worker_id: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = $3,
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(QueueStatus::Succeeded.as_str())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Terminal. Nothing is retried here; a caller who wants another go
    /// dispatches again.
    pub async fn mark_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        last_error: &str,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = $4,
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                last_error = $3,
                updated_at = now()
            WHERE id = $1
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(last_error)
        .bind(QueueStatus::Failed.as_str())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }
}

/// Renew three times per lease so one slow round trip cannot let it lapse.
fn renew_interval(lease_seconds: i64) -> Duration {
    let lease_ms = u64::try_from(lease_seconds.max(1)).unwrap_or(1) * 1000;
    Duration::from_millis((lease_ms / 3).max(100))
}

impl QueueRepo {
    /// Run one leased job to completion and settle its queue row.
    ///
    /// The lease is extended on a timer for as long as the handler runs, so
    /// the reaper only reclaims jobs whose worker actually went away.
    pub async fn run_leased(
        &self,
        runner: &TaskRunner,
        worker_id: &str,
        lease_seconds: i64,
        job: QueuedJob,
    ) -> RunOutcome {
        let handler = match job.handler() {
            Ok(handler) => handler,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "leased job has no handler");
                let err = TaskErrorInfo::new(e.to_string());
                if let Err(e) = runner.store().mark_failed(job.id, err.clone()).await {
                    tracing::error!(job_id = %job.id, error = %e, "could not fail task record");
                }
                settled(job.id, self.mark_failed(job.id, worker_id, &err.message).await);
                return RunOutcome::Failed(err);
            }
        };

        tracing::debug!(%worker_id, job_id = %job.id, %handler, "leased job");

        let run = runner.run(job.id, handler, job.owner_id, job.args());
        tokio::pin!(run);
        let mut renew = tokio::time::interval(renew_interval(lease_seconds));
        // the first tick fires at once; the lease is fresh
        renew.tick().await;

        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = renew.tick() => {
                    match self.extend_lease(job.id, worker_id, lease_seconds).await {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!(job_id = %job.id, %worker_id, "lease lost while the job was running"),
                        Err(e) => tracing::warn!(job_id = %job.id, error = %e, "lease renewal failed"),
                    }
                }
            }
        };

        let write = match &outcome {
            RunOutcome::Failed(err) => self.mark_failed(job.id, worker_id, &err.message).await,
            RunOutcome::Succeeded(_) | RunOutcome::Skipped(_) => {
                self.mark_succeeded(job.id, worker_id).await
            }
        };
        settled(job.id, write);
        outcome
    }
}

fn settled(job_id: Uuid, write: anyhow::Result<bool>) {
    match write {
        Ok(true) => {}
        Ok(false) => tracing::warn!(%job_id, "lease lost before the job finished"),
        Err(e) => tracing::error!(%job_id, error = %e, "could not update queue row"),
    }
}

/// Durable backend: submissions become `task_queue` rows that a worker
/// process leases and runs.
pub struct PgQueueBackend {
    queue: QueueRepo,
    queue_name: String,
    guard: PayloadGuard,
    runner: TaskRunner,
}

impl PgQueueBackend {
    pub fn new(
        queue: QueueRepo,
        queue_name: impl Into<String>,
        guard: PayloadGuard,
        runner: TaskRunner,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            guard,
            runner,
        }
    }
}

#[async_trait]
impl ExecutionBackend for PgQueueBackend {
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

        let job = NewQueuedJob {
            id: job_id,
            queue: self.queue_name.clone(),
            handler,
            owner_id: owner,
            args_json: Value::Object(args),
        };
        match self.queue.enqueue(job).await {
            Ok(_) => SubmissionHandle::pending(job_id),
            Err(e) => {
                tracing::error!(task_id = %job_id, %handler, error = %e, "enqueue failed");
                SubmissionHandle::failed(
                    job_id,
                    TaskErrorInfo::new(format!("enqueue failed: {e}")).with_traceback(format!("{e:?}")),
                )
            }
        }
    }
}
