// tests/dispatcher.rs
mod common;

use std::sync::Arc;

use common::{args, CapturedLogs, Harness, RecordingBackend, RefusingBackend};
use serde_json::json;
use uuid::Uuid;

use taskflow::handlers::Handler;
use taskflow::tasks::model::SUBMISSION_FAILURE_MESSAGE;
use taskflow::tasks::{
    DispatchError, PayloadGuard, RunOutcome, SubmissionStatus, TaskErrorInfo, TaskRegistry,
    TaskStatus, TaskStore, TaskType, User,
};

#[tokio::test]
async fn echo_goes_from_queued_to_success_without_progress() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");

    let dispatched = h
        .dispatcher
        .create_async_task("echo", Some(&user), args(json!({"x": 1})))
        .await
        .unwrap();

    assert_eq!(dispatched.record.status, TaskStatus::Queued);
    assert_eq!(dispatched.record.task_type, TaskType::Echo);
    assert_eq!(dispatched.record.user_id, user.id);
    assert!(!dispatched.record.is_progress_tracking);
    assert_eq!(dispatched.handle.immediate_status, SubmissionStatus::Pending);
    assert_eq!(dispatched.handle.job_id, dispatched.record.task_id);

    h.wait_idle().await;

    let record = h.tasks.get(dispatched.record.task_id).await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Success);
    assert_eq!(record.progress, None);
    assert_eq!(
        record.metadata.result,
        Some(json!({"changes": [], "data": {"x": 1}}))
    );
}

#[tokio::test]
async fn always_fails_ends_in_failure_with_a_message() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");

    let dispatched = h
        .dispatcher
        .create_async_task("always-fails", Some(&user), args(json!({})))
        .await
        .unwrap();
    h.wait_idle().await;

    let record = h.tasks.get(dispatched.record.task_id).await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Failure);
    let message = record.metadata.error_message().unwrap();
    assert!(message.contains("always fails"));
    assert!(record.metadata.error.unwrap().traceback.is_some());
}

#[tokio::test]
async fn progress_tracking_task_reaches_one_hundred() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");

    let dispatched = h
        .dispatcher
        .create_async_task("report-progress", Some(&user), args(json!({"steps": 5})))
        .await
        .unwrap();
    assert!(dispatched.record.is_progress_tracking);
    h.wait_idle().await;

    let record = h.tasks.get(dispatched.record.task_id).await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Success);
    assert_eq!(record.progress, Some(100.0));
}

#[tokio::test]
async fn unregistered_type_creates_no_record() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");
    let before = h.tasks.count().await.unwrap();

    let err = h
        .dispatcher
        .create_async_task("make-coffee", Some(&user), args(json!({})))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::NotRegistered(ref name) if name == "make-coffee"));
    assert_eq!(err.code(), "NOT_REGISTERED");
    assert_eq!(h.tasks.count().await.unwrap(), before);
}

#[tokio::test]
async fn diagnostic_types_are_not_registered_in_production() {
    let h = Harness::with_registry(TaskRegistry::new());
    let user = h.add_user("a@example.com");

    let err = h
        .dispatcher
        .create_async_task("echo", Some(&user), args(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotRegistered(_)));
    assert_eq!(h.tasks.count().await.unwrap(), 0);
}

#[tokio::test]
async fn missing_owner_is_rejected_before_any_record() {
    let h = Harness::new();

    let err = h
        .dispatcher
        .create_async_task("echo", None, args(json!({})))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::MissingOwner));
    assert_eq!(h.tasks.count().await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_owner_is_rejected_before_any_record() {
    let h = Harness::new();
    let stranger = User {
        id: Uuid::new_v4(),
        email: "nobody@example.com".into(),
    };

    let err = h
        .dispatcher
        .create_async_task("echo", Some(&stranger), args(json!({})))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::UnknownOwner(id) if id == stranger.id));
    assert_eq!(h.tasks.count().await.unwrap(), 0);
}

#[tokio::test]
async fn owner_ids_resolve_to_users() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");

    let dispatched = h
        .dispatcher
        .create_task_for("echo", Some(user.id), args(json!({})), false)
        .await
        .unwrap();
    assert_eq!(dispatched.record.user_id, user.id);
    h.wait_idle().await;

    let stranger = Uuid::new_v4();
    let err = h
        .dispatcher
        .create_task_for("echo", Some(stranger), args(json!({})), false)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnknownOwner(id) if id == stranger));
    assert_eq!(err.code(), "UNKNOWN_OWNER");

    let err = h
        .dispatcher
        .create_task_for("echo", None, args(json!({})), false)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::MissingOwner));

    assert_eq!(h.tasks.count().await.unwrap(), 1);
}

#[tokio::test]
async fn refused_submission_leaves_a_failed_record() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");
    let dispatcher = h.dispatcher_with(Arc::new(RefusingBackend {
        tasks: h.tasks.clone(),
        attach: None,
    }));

    let dispatched = dispatcher
        .create_async_task("echo", Some(&user), args(json!({})))
        .await
        .expect("a refused submission is not a dispatch error");

    assert!(dispatched.handle.is_failure());
    assert_eq!(dispatched.record.status, TaskStatus::Failure);
    assert_eq!(
        dispatched.record.metadata.error_message(),
        Some(SUBMISSION_FAILURE_MESSAGE)
    );

    let stored = h.tasks.get(dispatched.record.task_id).await.unwrap().unwrap();
    assert_eq!(stored, dispatched.record);
    assert_eq!(h.tasks.count().await.unwrap(), 1);
}

#[tokio::test]
async fn refused_submission_keeps_the_backend_error() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");
    let dispatcher = h.dispatcher_with(Arc::new(RefusingBackend {
        tasks: h.tasks.clone(),
        attach: Some(TaskErrorInfo::new("queue full").with_traceback("at enqueue()")),
    }));

    let dispatched = dispatcher
        .create_async_task("echo", Some(&user), args(json!({})))
        .await
        .unwrap();

    assert_eq!(dispatched.record.status, TaskStatus::Failure);
    let error = dispatched.record.metadata.error.unwrap();
    assert_eq!(error.message, "queue full");
    assert_eq!(error.traceback.as_deref(), Some("at enqueue()"));
}

#[tokio::test]
async fn oversized_payload_is_a_submission_failure() {
    let h = Harness::with_guard(PayloadGuard::new(64));
    let user = h.add_user("a@example.com");

    let dispatched = h
        .dispatcher
        .create_async_task("echo", Some(&user), args(json!({"blob": "x".repeat(500)})))
        .await
        .unwrap();

    assert!(dispatched.handle.is_failure());
    assert!(dispatched
        .handle
        .error
        .as_ref()
        .unwrap()
        .message
        .contains("PAYLOAD_TOO_LARGE"));
    assert_eq!(dispatched.record.status, TaskStatus::Failure);
    assert_eq!(
        dispatched.record.metadata.error_message(),
        Some(SUBMISSION_FAILURE_MESSAGE)
    );
}

#[tokio::test]
async fn submission_carries_the_record_id_and_owner() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");
    let backend = Arc::new(RecordingBackend::default());
    let dispatcher = h.dispatcher_with(backend.clone());

    let dispatched = dispatcher
        .create_async_task("export-channel", Some(&user), args(json!({"channel_id": "c1"})))
        .await
        .unwrap();

    let submissions = backend.submissions.lock().unwrap();
    assert_eq!(submissions.len(), 1);
    let sub = &submissions[0];
    assert_eq!(sub.job_id, dispatched.record.task_id);
    assert_eq!(sub.handler, Handler::ExportChannel);
    assert_eq!(sub.owner, Some(user.id));
    assert!(!sub.synchronous);
    assert_eq!(dispatched.record.status, TaskStatus::Queued);
    assert!(dispatched.record.is_progress_tracking);
}

#[tokio::test]
async fn affects_follows_channel_and_node_arguments() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");
    let dispatcher = h.dispatcher_with(Arc::new(RecordingBackend::default()));

    let both = dispatcher
        .create_async_task(
            "echo",
            Some(&user),
            args(json!({"channel_id": "c1", "node_ids": ["n1", "n2"]})),
        )
        .await
        .unwrap();
    let affects = both.record.metadata.affects;
    assert_eq!(affects.channel.as_deref(), Some("c1"));
    assert_eq!(affects.nodes, Some(vec!["n1".to_string(), "n2".to_string()]));

    let neither = dispatcher
        .create_async_task("echo", Some(&user), args(json!({"source_id": "s"})))
        .await
        .unwrap();
    assert!(neither.record.metadata.affects.is_empty());
}

#[tokio::test]
async fn synchronous_dispatch_returns_the_finished_record() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");

    let dispatched = h
        .dispatcher
        .create_task("echo", Some(&user), args(json!({"y": true})), true)
        .await
        .unwrap();

    assert_eq!(dispatched.handle.immediate_status, SubmissionStatus::Success);
    assert_eq!(
        dispatched.handle.result.as_ref().and_then(|r| r.data.clone()),
        Some(json!({"y": true}))
    );
    assert_eq!(dispatched.record.status, TaskStatus::Success);
}

#[tokio::test]
async fn synchronous_failure_is_recorded_with_the_handler_message() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");

    let dispatched = h
        .dispatcher
        .create_task("always-fails", Some(&user), args(json!({})), true)
        .await
        .unwrap();

    assert!(dispatched.handle.is_failure());
    assert_eq!(dispatched.record.status, TaskStatus::Failure);
    assert!(dispatched
        .record
        .metadata
        .error_message()
        .unwrap()
        .contains("always fails"));
}

#[tokio::test]
async fn synchronous_handler_failure_is_not_logged_as_a_submission_failure() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");
    let logs = CapturedLogs::default();
    let _guard = logs.install();

    let dispatched = h
        .dispatcher
        .create_task("always-fails", Some(&user), args(json!({})), true)
        .await
        .unwrap();
    assert_eq!(dispatched.record.status, TaskStatus::Failure);

    let text = logs.text();
    assert!(text.contains("synchronous task failed"), "{text}");
    assert!(!text.contains("task submission failed"), "{text}");
}

#[tokio::test]
async fn refused_submission_is_logged_as_such() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");
    let dispatcher = h.dispatcher_with(Arc::new(RefusingBackend {
        tasks: h.tasks.clone(),
        attach: None,
    }));
    let logs = CapturedLogs::default();
    let _guard = logs.install();

    dispatcher
        .create_task("echo", Some(&user), args(json!({})), true)
        .await
        .unwrap();

    let text = logs.text();
    assert!(text.contains("task submission failed"), "{text}");
    assert!(!text.contains("synchronous task failed"), "{text}");
}

#[tokio::test]
async fn redelivered_job_is_skipped_once_finished() {
    let h = Harness::new();
    let user = h.add_user("a@example.com");

    let dispatched = h
        .dispatcher
        .create_async_task("echo", Some(&user), args(json!({})))
        .await
        .unwrap();
    h.wait_idle().await;

    let again = h
        .runner
        .run(dispatched.record.task_id, Handler::Echo, Some(user.id), args(json!({})))
        .await;
    assert!(matches!(again, RunOutcome::Skipped(TaskStatus::Success)));
}

#[tokio::test]
async fn untracked_jobs_run_without_a_record() {
    let h = Harness::new();
    let channel = h.content.add_channel("Physics", Uuid::new_v4()).unwrap();

    let handle = h
        .dispatcher
        .enqueue_untracked(
            Handler::DeleteTree,
            None,
            args(json!({"tree_id": channel.tree_id})),
        )
        .await;
    assert_eq!(handle.immediate_status, SubmissionStatus::Pending);
    h.wait_idle().await;

    assert_eq!(h.tasks.count().await.unwrap(), 0);
    assert_eq!(h.content.node_count(&channel.root_id), 0);
}
