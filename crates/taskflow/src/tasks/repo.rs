// crates/taskflow/src/tasks/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::tasks::model::{
    clamp_progress, NewTaskRecord, TaskErrorInfo, TaskMetadata, TaskRecord, User,
    HANDLER_FAILURE_MESSAGE,
};
use crate::tasks::registry::TaskType;
use crate::tasks::status::TaskStatus;

/// Durable task records.
///
/// Writes are split by writer. The dispatcher only calls `create` and
/// `fail_submission`; everything from `mark_started` on belongs to the
/// handler's execution context. Every write is guarded by the source state
/// and reports whether it applied.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn user_exists(&self, user_id: Uuid) -> anyhow::Result<bool>;

    async fn get_user(&self, user_id: Uuid) -> anyhow::Result<Option<User>>;

    async fn get(&self, task_id: Uuid) -> anyhow::Result<Option<TaskRecord>>;

    async fn list_for_user(&self, user_id: Uuid, limit: i64) -> anyhow::Result<Vec<TaskRecord>>;

    async fn count(&self) -> anyhow::Result<i64>;

    /// Re-read a record in place.
    async fn refresh(&self, record: &mut TaskRecord) -> anyhow::Result<()> {
        match self.get(record.task_id).await? {
            Some(fresh) => {
                *record = fresh;
                Ok(())
            }
            None => anyhow::bail!("task {} disappeared", record.task_id),
        }
    }

    // ----------------------------
    // Dispatcher writes
    // ----------------------------

    async fn create(&self, new: NewTaskRecord) -> anyhow::Result<TaskRecord>;

    /// Force FAILURE after the backend refused a submission. Keeps any error
    /// message already written by the backend; otherwise uses `fallback`.
    /// A record that already succeeded is returned untouched.
    async fn fail_submission(
        &self,
        task_id: Uuid,
        fallback: &str,
    ) -> anyhow::Result<Option<TaskRecord>>;

    // ----------------------------
    // Handler writes
    // ----------------------------

    async fn mark_started(&self, task_id: Uuid) -> anyhow::Result<bool>;

    async fn update_progress(&self, task_id: Uuid, progress: f64) -> anyhow::Result<bool>;

    async fn mark_succeeded(&self, task_id: Uuid, result: Option<Value>) -> anyhow::Result<bool>;

    async fn mark_failed(&self, task_id: Uuid, error: TaskErrorInfo) -> anyhow::Result<bool>;
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    task_id: Uuid,
    task_type: String,
    status: String,
    is_progress_tracking: bool,
    progress: Option<f64>,
    user_id: Uuid,
    metadata: Json<TaskMetadata>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = anyhow::Error;

    fn try_from(row: TaskRow) -> anyhow::Result<Self> {
        let task_type = TaskType::parse(&row.task_type)
            .ok_or_else(|| anyhow::anyhow!("unknown task_type in tasks table: {}", row.task_type))?;
        let status = TaskStatus::parse(&row.status)
            .ok_or_else(|| anyhow::anyhow!("unknown status in tasks table: {}", row.status))?;

        Ok(TaskRecord {
            task_id: row.task_id,
            task_type,
            status,
            is_progress_tracking: row.is_progress_tracking,
            progress: row.progress,
            user_id: row.user_id,
            metadata: row.metadata.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const TASK_COLUMNS: &str = r#"
    task_id, task_type, status, is_progress_tracking, progress,
    user_id, metadata, created_at, updated_at
"#;

#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, task_id: Uuid) -> anyhow::Result<Option<TaskRecord>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRecord::try_from).transpose()
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn user_exists(&self, user_id: Uuid) -> anyhow::Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM users WHERE id = $1)")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn get_user(&self, user_id: Uuid) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT id, email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn get(&self, task_id: Uuid) -> anyhow::Result<Option<TaskRecord>> {
        self.fetch(task_id).await
    }

    async fn list_for_user(&self, user_id: Uuid, limit: i64) -> anyhow::Result<Vec<TaskRecord>> {
        let limit = limit.clamp(1, 500);

        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE user_id = $1
            ORDER BY created_at DESC, task_id DESC
            LIMIT $2
            "#
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TaskRecord::try_from).collect()
    }

    async fn count(&self) -> anyhow::Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    async fn create(&self, new: NewTaskRecord) -> anyhow::Result<TaskRecord> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            INSERT INTO tasks (task_id, task_type, status, is_progress_tracking, user_id, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.task_type.as_str())
        .bind(TaskStatus::Queued.as_str())
        .bind(new.is_progress_tracking)
        .bind(new.user_id)
        .bind(Json(&new.metadata))
        .fetch_one(&self.pool)
        .await?;

        TaskRecord::try_from(row)
    }

    async fn fail_submission(
        &self,
        task_id: Uuid,
        fallback: &str,
    ) -> anyhow::Result<Option<TaskRecord>> {
        // Single statement: the backend's failure hook may be writing the
        // same row, so the message merge happens inside Postgres.
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            UPDATE tasks
            SET status = 'FAILURE',
                metadata = jsonb_set(
                    metadata,
                    '{{error}}',
                    COALESCE(metadata->'error', '{{}}'::jsonb)
                      || jsonb_build_object(
                           'message',
                           COALESCE(NULLIF(btrim(metadata->'error'->>'message'), ''), $2)
                         )
                ),
                updated_at = now()
            WHERE task_id = $1
              AND status IN ('QUEUED', 'STARTED', 'FAILURE')
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task_id)
        .bind(fallback)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(TaskRecord::try_from(row)?)),
            None => self.fetch(task_id).await,
        }
    }

    async fn mark_started(&self, task_id: Uuid) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'STARTED',
                progress = CASE WHEN is_progress_tracking THEN 0 ELSE NULL END,
                updated_at = now()
            WHERE task_id = $1
              AND status = 'QUEUED'
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn update_progress(&self, task_id: Uuid, progress: f64) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET progress = $2,
                updated_at = now()
            WHERE task_id = $1
              AND status = 'STARTED'
              AND is_progress_tracking
            "#,
        )
        .bind(task_id)
        .bind(clamp_progress(progress))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn mark_succeeded(&self, task_id: Uuid, result: Option<Value>) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'SUCCESS',
                progress = CASE WHEN is_progress_tracking THEN 100 ELSE NULL END,
                metadata = CASE
                    WHEN $2::jsonb IS NULL THEN metadata
                    ELSE jsonb_set(metadata, '{result}', $2::jsonb)
                END,
                updated_at = now()
            WHERE task_id = $1
              AND status = 'STARTED'
            "#,
        )
        .bind(task_id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn mark_failed(&self, task_id: Uuid, error: TaskErrorInfo) -> anyhow::Result<bool> {
        let message = if error.has_message() {
            error.message
        } else {
            HANDLER_FAILURE_MESSAGE.to_string()
        };
        let mut error_json = json!({ "message": message });
        if let Some(tb) = error.traceback {
            error_json["traceback"] = Value::String(tb);
        }

        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'FAILURE',
                metadata = jsonb_set(
                    metadata,
                    '{error}',
                    COALESCE(metadata->'error', '{}'::jsonb) || $2::jsonb
                ),
                updated_at = now()
            WHERE task_id = $1
              AND status IN ('QUEUED', 'STARTED')
            "#,
        )
        .bind(task_id)
        .bind(error_json)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }
}
