//! REST surface of the progress channel server.

use reqwest::StatusCode;

use super::test_helpers::{spawn_server, test_config};

#[tokio::test]
async fn health_endpoint_answers_ok() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = spawn_server(test_config(dir.path())).await;

    let response = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .expect("health request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.expect("body"), "ok");
}

#[tokio::test]
async fn create_session_returns_201_with_the_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = spawn_server(test_config(dir.path())).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/api/sessions", server.addr))
        .json(&serde_json::json!({
            "session_id": "api-1",
            "metadata": { "title": "Quarterly Report" },
            "repo_path": "/srv/repos/report",
        }))
        .send()
        .await
        .expect("create request");
    assert_eq!(response.status(), StatusCode::CREATED);

    let body: serde_json::Value = response.json().await.expect("json body");
    assert_eq!(body["session_id"], "api-1");
    assert_eq!(body["state"], "CREATED");
    assert_eq!(body["metadata"]["title"], "Quarterly Report");
}

#[tokio::test]
async fn duplicate_session_is_rejected_with_409() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = spawn_server(test_config(dir.path())).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/api/sessions", server.addr);
    let body = serde_json::json!({ "session_id": "api-dup" });

    let first = client.post(&url).json(&body).send().await.expect("first");
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = client.post(&url).json(&body).send().await.expect("second");
    assert_eq!(second.status(), StatusCode::CONFLICT);

    let error: serde_json::Value = second.json().await.expect("error body");
    assert_eq!(error["error"], "duplicate_session");
}

#[tokio::test]
async fn unknown_session_lookup_is_404() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = spawn_server(test_config(dir.path())).await;

    let response = reqwest::get(format!("http://{}/api/sessions/absent", server.addr))
        .await
        .expect("lookup request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn launch_with_an_unknown_operation_is_400() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = spawn_server(test_config(dir.path())).await;
    let client = reqwest::Client::new();

    client
        .post(format!("http://{}/api/sessions", server.addr))
        .json(&serde_json::json!({ "session_id": "api-2" }))
        .send()
        .await
        .expect("create request");

    let response = client
        .post(format!("http://{}/api/sessions/api-2/launch", server.addr))
        .json(&serde_json::json!({ "operation": "rebuild-everything" }))
        .send()
        .await
        .expect("launch request");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn launch_against_an_unknown_session_is_404() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = spawn_server(test_config(dir.path())).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/api/sessions/absent/launch", server.addr))
        .json(&serde_json::json!({ "operation": "full-generate" }))
        .send()
        .await
        .expect("launch request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
