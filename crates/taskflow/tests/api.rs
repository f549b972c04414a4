// tests/api.rs
mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::Harness;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use taskflow::api::{router, ApiState};

fn app(h: &Harness) -> Router {
    router(ApiState::new(h.dispatcher.clone()))
}

async fn call(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let res = app.oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post(body: Value) -> Request<Body> {
    Request::post("/tasks")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_is_ok() {
    let h = Harness::new();
    let res = app(&h).oneshot(get("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn post_tasks_dispatches_and_returns_the_queued_record() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");

    let (status, body) = call(
        app(&h),
        post(json!({"task_type": "echo", "user_id": user.id, "args": {"x": 1}})),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["record"]["status"], "QUEUED");
    assert_eq!(body["record"]["task_type"], "echo");
    assert_eq!(body["handle"]["immediate_status"], "PENDING");
    assert_eq!(body["handle"]["job_id"], body["record"]["task_id"]);

    h.wait_idle().await;
    let task_id = body["record"]["task_id"].as_str().unwrap().to_string();
    let (status, body) = call(app(&h), get(&format!("/tasks/{task_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "SUCCESS");
}

#[tokio::test]
async fn synchronous_post_returns_ok_with_the_final_record() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");

    let (status, body) = call(
        app(&h),
        post(json!({"task_type": "echo", "user_id": user.id, "synchronous": true})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["record"]["status"], "SUCCESS");
}

#[tokio::test]
async fn rejected_dispatches_map_to_client_errors() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");

    let (status, body) = call(
        app(&h),
        post(json!({"task_type": "make-coffee", "user_id": user.id})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "NOT_REGISTERED");

    let (status, body) = call(app(&h), post(json!({"task_type": "echo"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "MISSING_OWNER");

    let (status, body) = call(
        app(&h),
        post(json!({"task_type": "echo", "user_id": Uuid::new_v4()})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "UNKNOWN_OWNER");

    let (status, body) = call(
        app(&h),
        post(json!({"task_type": "echo", "user_id": user.id, "args": [1, 2]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_ARGUMENTS");

    use taskflow::tasks::TaskStore;
    assert_eq!(h.tasks.count().await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_task_id_is_not_found() {
    let h = Harness::new();
    let (status, body) = call(app(&h), get(&format!("/tasks/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn list_returns_only_the_users_tasks() {
    let h = Harness::new();
    let alice = h.add_user("alice@example.com");
    let bob = h.add_user("bob@example.com");

    for user in [&alice, &alice, &bob] {
        let (status, _) = call(
            app(&h),
            post(json!({"task_type": "echo", "user_id": user.id})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    h.wait_idle().await;

    let (status, body) = call(app(&h), get(&format!("/tasks?user_id={}", alice.id))).await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|t| t["user_id"] == json!(alice.id)));

    let (_, body) = call(
        app(&h),
        get(&format!("/tasks?user_id={}&limit=1", alice.id)),
    )
    .await;
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
}
