use uuid::Uuid;

/// Errors `create_async_task` returns before or instead of dispatching.
/// A failed submission is not one of these: it is recorded on the task.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("task type `{0}` is not registered")]
    NotRegistered(String),

    #[error("all tasks must be assigned to a user")]
    MissingOwner,

    #[error("user {0} does not exist")]
    UnknownOwner(Uuid),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::NotRegistered(_) => "NOT_REGISTERED",
            DispatchError::MissingOwner => "MISSING_OWNER",
            DispatchError::UnknownOwner(_) => "UNKNOWN_OWNER",
            DispatchError::Store(_) => "STORE_ERROR",
        }
    }
}
