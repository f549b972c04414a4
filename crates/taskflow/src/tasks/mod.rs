pub mod backend;
pub mod dispatcher;
pub mod error;
pub mod local;
pub mod memory;
pub mod model;
pub mod queue;
pub mod registry;
pub mod repo;
pub mod runner;
pub mod status;

pub use backend::{ExecutionBackend, PayloadGuard, Submission, SubmissionHandle, SubmissionStatus};
pub use dispatcher::{DispatchedTask, Dispatcher};
pub use error::DispatchError;
pub use local::LocalBackend;
pub use memory::MemoryTaskStore;
pub use model::{Affects, TaskArgs, TaskErrorInfo, TaskMetadata, TaskRecord, User};
pub use queue::{PgQueueBackend, QueueRepo, QueuedJob};
pub use registry::{RegistryEntry, TaskRegistry, TaskType};
pub use repo::{PgTaskStore, TaskStore};
pub use runner::{RunOutcome, TaskRunner};
pub use status::TaskStatus;
