use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::tasks::{DispatchError, DispatchedTask, Dispatcher, TaskRecord, TaskStore};

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Dispatcher,
}

impl ApiState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    fn store(&self) -> &Arc<dyn TaskStore> {
        self.dispatcher.store()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:id", get(get_task))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn error(status: StatusCode, code: &'static str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: error.into(),
            code,
        }),
    )
}

fn internal_err(e: anyhow::Error) -> ApiError {
    error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL",
        format!("internal error: {e}"),
    )
}

fn dispatch_err(e: DispatchError) -> ApiError {
    let status = match &e {
        DispatchError::NotRegistered(_) | DispatchError::MissingOwner => StatusCode::BAD_REQUEST,
        DispatchError::UnknownOwner(_) => StatusCode::NOT_FOUND,
        DispatchError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error(status, e.code(), e.to_string())
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub task_type: String,
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub synchronous: bool,
}

pub async fn create_task(
    State(state): State<ApiState>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<DispatchedTask>), ApiError> {
    let CreateTaskRequest {
        task_type,
        user_id,
        args,
        synchronous,
    } = body;

    let args = match args {
        None | Some(Value::Null) => Default::default(),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(error(
                StatusCode::BAD_REQUEST,
                "BAD_ARGUMENTS",
                "args must be a JSON object",
            ))
        }
    };

    let dispatched = state
        .dispatcher
        .create_task_for(&task_type, user_id, args, synchronous)
        .await
        .map_err(dispatch_err)?;

    let status = if synchronous {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(dispatched)))
}

pub async fn get_task(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
) -> Result<Json<TaskRecord>, ApiError> {
    match state.store().get(id).await.map_err(internal_err)? {
        Some(record) => Ok(Json(record)),
        None => Err(error(StatusCode::NOT_FOUND, "NOT_FOUND", "task not found")),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub user_id: Uuid,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListTasksResponse {
    pub items: Vec<TaskRecord>,
}

pub async fn list_tasks(
    State(state): State<ApiState>,
    Query(q): Query<ListTasksQuery>,
) -> Result<Json<ListTasksResponse>, ApiError> {
    let limit = q.limit.unwrap_or(100).clamp(1, 500);
    let items = state
        .store()
        .list_for_user(q.user_id, limit)
        .await
        .map_err(internal_err)?;
    Ok(Json(ListTasksResponse { items }))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
