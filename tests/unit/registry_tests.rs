//! Session registry behavior tests: the four operations and eviction.

use std::collections::HashMap;
use std::time::Duration;

use paperflow::models::progress::{ProgressMessage, ProgressStatus};
use paperflow::models::session::{SessionError, SessionState};
use paperflow::registry::SessionRegistry;
use paperflow::AppError;

fn registry() -> SessionRegistry {
    SessionRegistry::new(Duration::from_secs(3600), Duration::from_secs(3600))
}

#[tokio::test]
async fn create_then_duplicate_is_rejected() {
    let registry = registry();
    registry
        .create("run-1", HashMap::new(), None)
        .await
        .expect("first create");

    let err = registry
        .create("run-1", HashMap::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::DuplicateSession(_)), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn racing_creates_admit_exactly_one() {
    let registry = std::sync::Arc::new(registry());

    let mut launches = Vec::new();
    for _ in 0..32 {
        let registry = std::sync::Arc::clone(&registry);
        launches.push(tokio::spawn(async move {
            registry.create("run-racy", HashMap::new(), None).await
        }));
    }

    let mut created = 0;
    let mut duplicates = 0;
    for launch in launches {
        match launch.await.expect("create task") {
            Ok(_) => created += 1,
            Err(AppError::DuplicateSession(_)) => duplicates += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(created, 1, "exactly one racing create may win");
    assert_eq!(duplicates, 31);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn terminal_session_id_may_be_reused() {
    let registry = registry();
    registry.create("run-1", HashMap::new(), None).await.unwrap();
    registry
        .finalize("run-1", Ok(serde_json::json!({"doc": "a"})))
        .await
        .unwrap();

    registry
        .create("run-1", HashMap::new(), None)
        .await
        .expect("terminal id is reusable");
}

#[tokio::test]
async fn create_stages_metadata() {
    let registry = registry();
    let metadata = HashMap::from([("title".to_owned(), "Change Request 7".to_owned())]);
    let session = registry
        .create("run-1", metadata, Some("/srv/repo".into()))
        .await
        .unwrap();
    assert_eq!(session.state, SessionState::Created);
    assert_eq!(session.metadata.get("title").map(String::as_str), Some("Change Request 7"));
    assert_eq!(session.repo_path.as_deref(), Some("/srv/repo"));
}

#[tokio::test]
async fn publish_to_unknown_session_is_not_found() {
    let registry = registry();
    let err = registry
        .publish(
            "ghost",
            ProgressMessage::stage("ghost", ProgressStatus::Received, 0, "hello"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn publish_advances_state_and_progress() {
    let registry = registry();
    registry.create("run-1", HashMap::new(), None).await.unwrap();

    registry
        .publish(
            "run-1",
            ProgressMessage::stage("run-1", ProgressStatus::Received, 0, "picked up"),
        )
        .await
        .unwrap();
    registry
        .publish(
            "run-1",
            ProgressMessage::stage("run-1", ProgressStatus::AnalyzingSource, 20, "parsing"),
        )
        .await
        .unwrap();

    let session = registry.snapshot("run-1").await.unwrap();
    assert_eq!(session.state, SessionState::AnalyzingSource);
    assert_eq!(session.progress, 20);
}

#[tokio::test]
async fn progress_regression_is_rejected() {
    let registry = registry();
    registry.create("run-1", HashMap::new(), None).await.unwrap();
    registry
        .publish(
            "run-1",
            ProgressMessage::stage("run-1", ProgressStatus::Generating, 80, "rendering"),
        )
        .await
        .unwrap();

    let err = registry
        .publish(
            "run-1",
            ProgressMessage::stage("run-1", ProgressStatus::Generating, 40, "backwards"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let session = registry.snapshot("run-1").await.unwrap();
    assert_eq!(session.progress, 80);
}

#[tokio::test]
async fn keepalive_publishes_change_no_state() {
    let registry = registry();
    registry.create("run-1", HashMap::new(), None).await.unwrap();
    registry
        .publish("run-1", ProgressMessage::keepalive("run-1", "ping"))
        .await
        .unwrap();

    let session = registry.snapshot("run-1").await.unwrap();
    assert_eq!(session.state, SessionState::Created);
    assert_eq!(session.progress, 0);
}

#[tokio::test]
async fn no_nonkeepalive_message_after_terminal() {
    let registry = registry();
    registry.create("run-1", HashMap::new(), None).await.unwrap();
    registry
        .finalize("run-1", Ok(serde_json::json!({"doc": "out"})))
        .await
        .unwrap();

    let err = registry
        .publish(
            "run-1",
            ProgressMessage::stage("run-1", ProgressStatus::Generating, 90, "late"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    // Keepalives remain harmless after terminal.
    registry
        .publish("run-1", ProgressMessage::keepalive("run-1", "ping"))
        .await
        .unwrap();
}

#[tokio::test]
async fn finalize_is_exactly_once() {
    let registry = registry();
    registry.create("run-1", HashMap::new(), None).await.unwrap();

    let first = registry
        .finalize("run-1", Ok(serde_json::json!({"doc": "out"})))
        .await
        .unwrap();
    assert_eq!(first.state, SessionState::Completed);
    assert_eq!(first.progress, 100);

    // Second call is a warn-level no-op, never an error to the caller.
    let second = registry
        .finalize(
            "run-1",
            Err(SessionError {
                category: "late".into(),
                message: "should be ignored".into(),
            }),
        )
        .await
        .unwrap();
    assert_eq!(second.state, SessionState::Completed);
    assert!(second.error.is_none());
}

#[tokio::test]
async fn terminal_publish_routes_through_finalize() {
    let registry = registry();
    registry.create("run-1", HashMap::new(), None).await.unwrap();

    let mut done = ProgressMessage::completed("run-1", serde_json::json!({"doc": "out.xlsx"}));
    done.progress = 100;
    registry.publish("run-1", done).await.unwrap();

    let session = registry.snapshot("run-1").await.unwrap();
    assert_eq!(session.state, SessionState::Completed);
    assert_eq!(
        session.result,
        Some(serde_json::json!({"doc": "out.xlsx"}))
    );
}

#[tokio::test]
async fn error_publish_records_category() {
    let registry = registry();
    registry.create("run-1", HashMap::new(), None).await.unwrap();
    registry
        .publish("run-1", ProgressMessage::failed("run-1", "llm", "model unavailable"))
        .await
        .unwrap();

    let session = registry.snapshot("run-1").await.unwrap();
    assert_eq!(session.state, SessionState::Error);
    let error = session.error.expect("error recorded");
    assert_eq!(error.category, "llm");
    assert_eq!(error.message, "model unavailable");
}

#[tokio::test]
async fn error_publish_is_exempt_from_progress_monotonicity() {
    let registry = registry();
    registry.create("run-1", HashMap::new(), None).await.unwrap();
    registry
        .publish(
            "run-1",
            ProgressMessage::stage("run-1", ProgressStatus::Generating, 70, "rendering"),
        )
        .await
        .unwrap();

    // A failure terminal carries progress 0 and must still land.
    registry
        .publish("run-1", ProgressMessage::failed("run-1", "llm", "model unavailable"))
        .await
        .unwrap();

    let session = registry.snapshot("run-1").await.unwrap();
    assert_eq!(session.state, SessionState::Error);
}

#[tokio::test]
async fn attached_channel_receives_published_messages_in_order() {
    let registry = registry();
    registry.create("run-1", HashMap::new(), None).await.unwrap();
    let mut attachment = registry.attach_channel("run-1").await.unwrap();

    for (status, progress) in [
        (ProgressStatus::Received, 0),
        (ProgressStatus::AnalyzingSource, 20),
        (ProgressStatus::Generating, 80),
    ] {
        registry
            .publish(
                "run-1",
                ProgressMessage::stage("run-1", status, progress, "step"),
            )
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(attachment.rx.recv().await.expect("message").progress);
    }
    assert_eq!(seen, vec![0, 20, 80]);
}

#[tokio::test]
async fn late_attach_replays_latest_message_only() {
    let registry = registry();
    registry.create("run-1", HashMap::new(), None).await.unwrap();
    for (status, progress) in [
        (ProgressStatus::Received, 0),
        (ProgressStatus::AnalyzingSource, 20),
        (ProgressStatus::Generating, 60),
    ] {
        registry
            .publish(
                "run-1",
                ProgressMessage::stage("run-1", status, progress, "step"),
            )
            .await
            .unwrap();
    }

    let mut attachment = registry.attach_channel("run-1").await.unwrap();
    let replay = attachment.rx.recv().await.expect("replay");
    assert_eq!(replay.progress, 60);
    assert_eq!(replay.status, ProgressStatus::Generating);

    // Nothing else buffered: the queue is now empty.
    assert!(attachment.rx.try_recv().is_err());
}

#[tokio::test]
async fn second_attach_supersedes_first() {
    let registry = registry();
    registry.create("run-1", HashMap::new(), None).await.unwrap();

    let first = registry.attach_channel("run-1").await.unwrap();
    assert!(!first.superseded.is_cancelled());

    let mut second = registry.attach_channel("run-1").await.unwrap();
    assert!(first.superseded.is_cancelled(), "old channel must be closed");
    assert!(!second.superseded.is_cancelled());

    registry
        .publish(
            "run-1",
            ProgressMessage::stage("run-1", ProgressStatus::Received, 0, "hello"),
        )
        .await
        .unwrap();
    assert_eq!(second.rx.recv().await.expect("delivered to new channel").progress, 0);
}

#[tokio::test]
async fn detach_ignores_stale_sequence() {
    let registry = registry();
    registry.create("run-1", HashMap::new(), None).await.unwrap();
    let first = registry.attach_channel("run-1").await.unwrap();
    let second = registry.attach_channel("run-1").await.unwrap();

    // Old connection tears down after being superseded; its detach must
    // not evict the successor.
    registry.detach_channel("run-1", first.seq).await;

    registry
        .publish(
            "run-1",
            ProgressMessage::stage("run-1", ProgressStatus::Received, 0, "hello"),
        )
        .await
        .unwrap();
    let mut rx = second.rx;
    assert_eq!(rx.recv().await.expect("still attached").progress, 0);
}

#[tokio::test]
async fn eviction_removes_expired_terminal_sessions() {
    let registry = SessionRegistry::new(Duration::from_millis(50), Duration::from_secs(3600));
    registry.create("run-1", HashMap::new(), None).await.unwrap();
    registry
        .finalize("run-1", Ok(serde_json::Value::Null))
        .await
        .unwrap();

    assert_eq!(registry.evict_expired().await, 0, "not yet expired");
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(registry.evict_expired().await, 1);
    assert!(registry.snapshot("run-1").await.is_none());
}

#[tokio::test]
async fn eviction_removes_stale_created_sessions() {
    let registry = SessionRegistry::new(Duration::from_secs(3600), Duration::from_millis(50));
    registry.create("stale", HashMap::new(), None).await.unwrap();
    registry.create("attached", HashMap::new(), None).await.unwrap();
    let _attachment = registry.attach_channel("attached").await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(registry.evict_expired().await, 1);
    assert!(registry.snapshot("stale").await.is_none());
    assert!(registry.snapshot("attached").await.is_some(), "attached session survives staging");
}

#[tokio::test]
async fn ensure_is_idempotent() {
    let registry = registry();
    let first = registry.ensure("req-1").await.unwrap();
    let second = registry.ensure("req-1").await.unwrap();
    assert_eq!(first.session_id, second.session_id);
    assert_eq!(registry.len(), 1);
}
