//! Channel supersession: one subscriber per session, newest wins.

use std::collections::HashMap;

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use paperflow::channel::protocol::CLOSE_SUPERSEDED;
use paperflow::models::progress::{ProgressMessage, ProgressStatus};

use super::test_helpers::{
    connect_publisher, connect_subscriber, next_user_message, read_until_close, send_message,
    spawn_server, test_config,
};

#[tokio::test]
async fn second_subscriber_supersedes_the_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = spawn_server(test_config(dir.path())).await;
    let session_id = "supersede-1";

    server
        .state
        .registry
        .create(session_id, HashMap::new(), None)
        .await
        .expect("create session");

    let mut first = connect_subscriber(server.addr, session_id).await;
    let mut second = connect_subscriber(server.addr, session_id).await;

    // The earlier channel is closed with the supersession code.
    let close = read_until_close(&mut first).await.expect("close frame");
    assert_eq!(close.code, CloseCode::from(CLOSE_SUPERSEDED));

    // Publishes land on the surviving channel.
    let mut publisher = connect_publisher(server.addr, session_id).await;
    send_message(
        &mut publisher,
        &ProgressMessage::stage(session_id, ProgressStatus::Received, 0, "request received"),
    )
    .await;

    let seen = next_user_message(&mut second).await.expect("stage");
    assert_eq!(seen.status, ProgressStatus::Received);
}

#[tokio::test]
async fn superseded_close_does_not_finalize_the_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = spawn_server(test_config(dir.path())).await;
    let session_id = "supersede-2";

    server
        .state
        .registry
        .create(session_id, HashMap::new(), None)
        .await
        .expect("create session");

    let mut first = connect_subscriber(server.addr, session_id).await;
    let _second = connect_subscriber(server.addr, session_id).await;
    read_until_close(&mut first).await;

    let session = server
        .state
        .registry
        .snapshot(session_id)
        .await
        .expect("snapshot");
    assert!(!session.state.is_terminal());
}
