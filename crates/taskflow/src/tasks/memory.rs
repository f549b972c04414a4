//! Process-local [`TaskStore`] used by tests and by [`LocalBackend`] setups.
//!
//! Same guards as the Postgres store; nothing survives the process.
//!
//! [`LocalBackend`]: crate::tasks::local::LocalBackend

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::tasks::model::{
    clamp_progress, NewTaskRecord, TaskErrorInfo, TaskRecord, User, HANDLER_FAILURE_MESSAGE,
};
use crate::tasks::repo::TaskStore;
use crate::tasks::status::TaskStatus;

fn poison_err<T>(_: PoisonError<T>) -> anyhow::Error {
    anyhow::anyhow!("task store lock poisoned")
}

#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    users: RwLock<HashMap<Uuid, User>>,
    tasks: RwLock<HashMap<Uuid, TaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, email: &str) -> anyhow::Result<User> {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
        };
        self.insert_user(user.clone())?;
        Ok(user)
    }

    pub fn insert_user(&self, user: User) -> anyhow::Result<()> {
        self.users
            .write()
            .map_err(poison_err)?
            .insert(user.id, user);
        Ok(())
    }

    /// What a backend failure hook does: attach error details without
    /// touching the status. A failed record never ends up with a blank
    /// message.
    pub fn attach_error(&self, task_id: Uuid, error: TaskErrorInfo) -> anyhow::Result<bool> {
        self.update(task_id, |record| {
            if record.status == TaskStatus::Failure {
                record.metadata.error = None;
                record
                    .metadata
                    .merge_error(Some(error), HANDLER_FAILURE_MESSAGE);
            } else {
                record.metadata.error = Some(error);
            }
            true
        })
    }

    fn update(
        &self,
        task_id: Uuid,
        f: impl FnOnce(&mut TaskRecord) -> bool,
    ) -> anyhow::Result<bool> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        let Some(record) = tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        let applied = f(record);
        if applied {
            record.updated_at = Utc::now();
        }
        Ok(applied)
    }

    fn transition(
        &self,
        task_id: Uuid,
        next: TaskStatus,
        f: impl FnOnce(&mut TaskRecord),
    ) -> anyhow::Result<bool> {
        self.update(task_id, |record| {
            if !record.status.can_transition_to(next) {
                return false;
            }
            record.status = next;
            f(record);
            true
        })
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn user_exists(&self, user_id: Uuid) -> anyhow::Result<bool> {
        Ok(self.users.read().map_err(poison_err)?.contains_key(&user_id))
    }

    async fn get_user(&self, user_id: Uuid) -> anyhow::Result<Option<User>> {
        Ok(self.users.read().map_err(poison_err)?.get(&user_id).cloned())
    }

    async fn get(&self, task_id: Uuid) -> anyhow::Result<Option<TaskRecord>> {
        Ok(self.tasks.read().map_err(poison_err)?.get(&task_id).cloned())
    }

    async fn list_for_user(&self, user_id: Uuid, limit: i64) -> anyhow::Result<Vec<TaskRecord>> {
        let limit = limit.clamp(1, 500) as usize;
        let mut records: Vec<TaskRecord> = self
            .tasks
            .read()
            .map_err(poison_err)?
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.task_id.cmp(&a.task_id))
        });
        records.truncate(limit);
        Ok(records)
    }

    async fn count(&self) -> anyhow::Result<i64> {
        Ok(self.tasks.read().map_err(poison_err)?.len() as i64)
    }

    async fn create(&self, new: NewTaskRecord) -> anyhow::Result<TaskRecord> {
        let now = Utc::now();
        let record = TaskRecord {
            task_id: Uuid::new_v4(),
            task_type: new.task_type,
            status: TaskStatus::Queued,
            is_progress_tracking: new.is_progress_tracking,
            progress: None,
            user_id: new.user_id,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        self.tasks
            .write()
            .map_err(poison_err)?
            .insert(record.task_id, record.clone());
        Ok(record)
    }

    async fn fail_submission(
        &self,
        task_id: Uuid,
        fallback: &str,
    ) -> anyhow::Result<Option<TaskRecord>> {
        self.update(task_id, |record| {
            if record.status == TaskStatus::Success {
                return false;
            }
            record.status = TaskStatus::Failure;
            record.metadata.merge_error(None, fallback);
            true
        })?;
        self.get(task_id).await
    }

    async fn mark_started(&self, task_id: Uuid) -> anyhow::Result<bool> {
        self.transition(task_id, TaskStatus::Started, |record| {
            record.progress = record.is_progress_tracking.then_some(0.0);
        })
    }

    async fn update_progress(&self, task_id: Uuid, progress: f64) -> anyhow::Result<bool> {
        self.update(task_id, |record| {
            if record.status != TaskStatus::Started || !record.is_progress_tracking {
                return false;
            }
            record.progress = Some(clamp_progress(progress));
            true
        })
    }

    async fn mark_succeeded(&self, task_id: Uuid, result: Option<Value>) -> anyhow::Result<bool> {
        self.transition(task_id, TaskStatus::Success, |record| {
            record.progress = record.is_progress_tracking.then_some(100.0);
            if result.is_some() {
                record.metadata.result = result;
            }
        })
    }

    async fn mark_failed(&self, task_id: Uuid, error: TaskErrorInfo) -> anyhow::Result<bool> {
        self.transition(task_id, TaskStatus::Failure, |record| {
            let current = record.metadata.error.take().unwrap_or_default();
            let message = if error.has_message() {
                error.message
            } else {
                HANDLER_FAILURE_MESSAGE.to_string()
            };
            record.metadata.error = Some(TaskErrorInfo {
                message,
                traceback: error.traceback.or(current.traceback),
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::{Affects, TaskMetadata, SUBMISSION_FAILURE_MESSAGE};
    use crate::tasks::registry::TaskType;

    async fn queued(store: &MemoryTaskStore, tracking: bool) -> TaskRecord {
        let user = store.add_user("owner@example.com").unwrap();
        store
            .create(NewTaskRecord {
                task_type: TaskType::ExportChannel,
                is_progress_tracking: tracking,
                user_id: user.id,
                metadata: TaskMetadata::new(Affects::default()),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn handler_writes_follow_the_state_machine() {
        let store = MemoryTaskStore::new();
        let rec = queued(&store, true).await;

        assert!(!store.mark_succeeded(rec.task_id, None).await.unwrap());
        assert!(store.mark_started(rec.task_id).await.unwrap());
        assert!(!store.mark_started(rec.task_id).await.unwrap());
        assert!(store.update_progress(rec.task_id, 40.0).await.unwrap());
        assert!(store.mark_succeeded(rec.task_id, None).await.unwrap());
        assert!(!store.mark_failed(rec.task_id, TaskErrorInfo::new("late")).await.unwrap());
        assert!(!store.update_progress(rec.task_id, 10.0).await.unwrap());

        let rec = store.get(rec.task_id).await.unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Success);
        assert_eq!(rec.progress, Some(100.0));
        assert!(rec.metadata.error.is_none());
    }

    #[tokio::test]
    async fn progress_ignored_for_untracked_tasks() {
        let store = MemoryTaskStore::new();
        let rec = queued(&store, false).await;
        store.mark_started(rec.task_id).await.unwrap();
        assert!(!store.update_progress(rec.task_id, 50.0).await.unwrap());
        store.mark_succeeded(rec.task_id, None).await.unwrap();
        assert_eq!(store.get(rec.task_id).await.unwrap().unwrap().progress, None);
    }

    #[tokio::test]
    async fn fail_submission_does_not_undo_success() {
        let store = MemoryTaskStore::new();
        let rec = queued(&store, false).await;
        store.mark_started(rec.task_id).await.unwrap();
        store.mark_succeeded(rec.task_id, None).await.unwrap();

        let after = store
            .fail_submission(rec.task_id, SUBMISSION_FAILURE_MESSAGE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn blank_failure_message_is_replaced() {
        let store = MemoryTaskStore::new();
        let rec = queued(&store, false).await;
        store
            .mark_failed(rec.task_id, TaskErrorInfo::new("  "))
            .await
            .unwrap();
        let rec = store.get(rec.task_id).await.unwrap().unwrap();
        assert_eq!(rec.metadata.error_message(), Some(HANDLER_FAILURE_MESSAGE));
    }

    #[tokio::test]
    async fn attaching_a_blank_error_to_a_failed_record_keeps_a_message() {
        let store = MemoryTaskStore::new();
        let rec = queued(&store, false).await;
        store
            .mark_failed(rec.task_id, TaskErrorInfo::new("disk full"))
            .await
            .unwrap();

        store
            .attach_error(rec.task_id, TaskErrorInfo::new("").with_traceback("at export()"))
            .unwrap();
        let rec = store.get(rec.task_id).await.unwrap().unwrap();
        assert_eq!(rec.metadata.error_message(), Some(HANDLER_FAILURE_MESSAGE));
        assert_eq!(
            rec.metadata.error.unwrap().traceback.as_deref(),
            Some("at export()")
        );
    }

    #[tokio::test]
    async fn attaching_an_error_to_a_queued_record_keeps_it_verbatim() {
        let store = MemoryTaskStore::new();
        let rec = queued(&store, false).await;
        store
            .attach_error(rec.task_id, TaskErrorInfo::new("broker down"))
            .unwrap();
        let rec = store.get(rec.task_id).await.unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Queued);
        assert_eq!(rec.metadata.error_message(), Some("broker down"));
    }
}
