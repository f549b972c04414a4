#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use taskflow::content::{MemoryContentStore, RecordingMailer, Services};
use taskflow::tasks::{
    Dispatcher, ExecutionBackend, LocalBackend, MemoryTaskStore, PayloadGuard, Submission,
    SubmissionHandle, TaskArgs, TaskErrorInfo, TaskRegistry, TaskRunner, User,
};

/// Log lines written while the returned guard is alive, for tests on the
/// current thread.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let sink = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn args(v: Value) -> TaskArgs {
    v.as_object().cloned().expect("args must be a JSON object")
}

/// Everything a dispatcher test needs, all in memory.
pub struct Harness {
    pub tasks: Arc<MemoryTaskStore>,
    pub content: Arc<MemoryContentStore>,
    pub mailer: Arc<RecordingMailer>,
    pub exports_dir: PathBuf,
    pub runner: TaskRunner,
    pub backend: Arc<LocalBackend>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_registry(TaskRegistry::with_diagnostics())
    }

    pub fn with_registry(registry: TaskRegistry) -> Self {
        Self::build(registry, PayloadGuard::default())
    }

    pub fn with_guard(guard: PayloadGuard) -> Self {
        Self::build(TaskRegistry::with_diagnostics(), guard)
    }

    fn build(registry: TaskRegistry, guard: PayloadGuard) -> Self {
        let tasks = Arc::new(MemoryTaskStore::new());
        let content = Arc::new(MemoryContentStore::new());
        let mailer = Arc::new(RecordingMailer::new());
        let exports_dir = std::env::temp_dir().join(format!("taskflow-test-{}", Uuid::new_v4()));

        let services = Services::new(content.clone(), mailer.clone(), exports_dir.clone());
        let runner = TaskRunner::new(tasks.clone(), services);
        let backend = Arc::new(LocalBackend::with_guard(runner.clone(), guard));
        let dispatcher = Dispatcher::new(registry, tasks.clone(), backend.clone());

        Self {
            tasks,
            content,
            mailer,
            exports_dir,
            runner,
            backend,
            dispatcher,
        }
    }

    /// Same stores, different backend.
    pub fn dispatcher_with(&self, backend: Arc<dyn ExecutionBackend>) -> Dispatcher {
        Dispatcher::new(TaskRegistry::with_diagnostics(), self.tasks.clone(), backend)
    }

    pub fn add_user(&self, email: &str) -> User {
        let user = self.tasks.add_user(email).expect("add user");
        self.content.insert_user(user.clone()).expect("add user");
        user
    }

    pub async fn wait_idle(&self) {
        self.backend.wait_idle().await;
    }
}

/// Refuses every submission, optionally after writing error details onto
/// the record the way a broker failure hook would.
pub struct RefusingBackend {
    pub tasks: Arc<MemoryTaskStore>,
    pub attach: Option<TaskErrorInfo>,
}

#[async_trait]
impl ExecutionBackend for RefusingBackend {
    async fn submit(&self, submission: Submission) -> SubmissionHandle {
        if let Some(err) = &self.attach {
            self.tasks
                .attach_error(submission.job_id, err.clone())
                .expect("attach error");
        }
        SubmissionHandle::failed(submission.job_id, TaskErrorInfo::new("broker unavailable"))
    }
}

/// Accepts everything and runs nothing.
#[derive(Default)]
pub struct RecordingBackend {
    pub submissions: Mutex<Vec<Submission>>,
}

#[async_trait]
impl ExecutionBackend for RecordingBackend {
    async fn submit(&self, submission: Submission) -> SubmissionHandle {
        let job_id = submission.job_id;
        self.submissions.lock().unwrap().push(submission);
        SubmissionHandle::pending(job_id)
    }
}

/// Postgres-backed tests need TEST_DATABASE_URL; without it they skip.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query(
        r#"
        TRUNCATE TABLE
            task_queue,
            tasks,
            metadata_cache,
            channel_members,
            channels,
            content_nodes,
            users
        CASCADE
        "#,
    )
    .execute(&pool)
    .await
    .expect("truncate failed");

    Some(pool)
}

pub async fn insert_user(pool: &PgPool, email: &str) -> User {
    let id: Uuid = sqlx::query_scalar("INSERT INTO users (id, email) VALUES ($1, $2) RETURNING id")
        .bind(Uuid::new_v4())
        .bind(email)
        .fetch_one(pool)
        .await
        .expect("failed to insert user");

    User {
        id,
        email: email.to_string(),
    }
}
