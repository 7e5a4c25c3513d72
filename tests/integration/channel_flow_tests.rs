//! End-to-end progress channel flow over a live server.

use std::collections::HashMap;

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use paperflow::channel::protocol::CLOSE_NORMAL;
use paperflow::models::progress::{ProgressMessage, ProgressStatus};
use paperflow::models::session::SessionState;

use super::test_helpers::{
    connect_publisher, connect_subscriber, next_user_message, read_until_close, send_message,
    spawn_server, test_config,
};

#[tokio::test]
async fn full_run_streams_ordered_stages_and_closes_normally() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = spawn_server(test_config(dir.path())).await;
    let session_id = "flow-1";

    server
        .state
        .registry
        .create(session_id, HashMap::new(), Some("/tmp/repo".into()))
        .await
        .expect("create session");

    let mut subscriber = connect_subscriber(server.addr, session_id).await;
    let mut publisher = connect_publisher(server.addr, session_id).await;

    send_message(
        &mut publisher,
        &ProgressMessage::stage(session_id, ProgressStatus::Received, 0, "request received"),
    )
    .await;
    send_message(
        &mut publisher,
        &ProgressMessage::stage(
            session_id,
            ProgressStatus::AnalyzingSource,
            20,
            "scanning repository",
        ),
    )
    .await;
    send_message(
        &mut publisher,
        &ProgressMessage::stage(session_id, ProgressStatus::Generating, 80, "rendering")
            .with_step("rendering", 3, 4),
    )
    .await;
    send_message(
        &mut publisher,
        &ProgressMessage::completed(session_id, serde_json::json!({ "html": "out.html" })),
    )
    .await;

    let first = next_user_message(&mut subscriber).await.expect("received");
    assert_eq!(first.status, ProgressStatus::Received);
    assert_eq!(first.progress, 0);

    let second = next_user_message(&mut subscriber).await.expect("analyzing");
    assert_eq!(second.status, ProgressStatus::AnalyzingSource);
    assert_eq!(second.progress, 20);

    let third = next_user_message(&mut subscriber).await.expect("generating");
    assert_eq!(third.status, ProgressStatus::Generating);
    assert_eq!(third.current_step.as_deref(), Some("rendering"));
    assert_eq!(third.steps_completed, Some(3));
    assert_eq!(third.total_steps, Some(4));

    let last = next_user_message(&mut subscriber).await.expect("completed");
    assert_eq!(last.status, ProgressStatus::Completed);
    assert_eq!(last.progress, 100);
    assert_eq!(
        last.result,
        Some(serde_json::json!({ "html": "out.html" }))
    );

    let close = read_until_close(&mut subscriber).await.expect("close frame");
    assert_eq!(close.code, CloseCode::from(CLOSE_NORMAL));

    let session = server
        .state
        .registry
        .snapshot(session_id)
        .await
        .expect("session snapshot");
    assert_eq!(session.state, SessionState::Completed);
    assert_eq!(session.progress, 100);
    assert!(session.result.is_some());
}

#[tokio::test]
async fn keepalives_never_reach_the_subscriber_as_progress() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = spawn_server(test_config(dir.path())).await;
    let session_id = "flow-keepalive";

    server
        .state
        .registry
        .create(session_id, HashMap::new(), None)
        .await
        .expect("create session");

    let mut subscriber = connect_subscriber(server.addr, session_id).await;
    let mut publisher = connect_publisher(server.addr, session_id).await;

    send_message(
        &mut publisher,
        &ProgressMessage::keepalive(session_id, "ping"),
    )
    .await;
    send_message(
        &mut publisher,
        &ProgressMessage::stage(session_id, ProgressStatus::Received, 0, "request received"),
    )
    .await;

    // The helper skips system frames, so the first user message must be
    // the real stage, not the keepalive.
    let first = next_user_message(&mut subscriber).await.expect("stage");
    assert_eq!(first.status, ProgressStatus::Received);

    let session = server
        .state
        .registry
        .snapshot(session_id)
        .await
        .expect("snapshot");
    assert_eq!(session.state, SessionState::Received);
}

#[tokio::test]
async fn late_subscriber_sees_latest_buffered_message() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = spawn_server(test_config(dir.path())).await;
    let session_id = "flow-late";

    server
        .state
        .registry
        .create(session_id, HashMap::new(), None)
        .await
        .expect("create session");

    let mut publisher = connect_publisher(server.addr, session_id).await;
    send_message(
        &mut publisher,
        &ProgressMessage::stage(session_id, ProgressStatus::Received, 0, "request received"),
    )
    .await;
    send_message(
        &mut publisher,
        &ProgressMessage::stage(
            session_id,
            ProgressStatus::AnalyzingSource,
            30,
            "scanning repository",
        ),
    )
    .await;

    // Give the server a moment to apply both publishes before attaching.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let mut subscriber = connect_subscriber(server.addr, session_id).await;
    let replay = next_user_message(&mut subscriber).await.expect("replay");
    assert_eq!(replay.status, ProgressStatus::AnalyzingSource);
    assert_eq!(replay.progress, 30);
}
