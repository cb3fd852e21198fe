// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use axum_test::TestServer;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::Config;
use crate::run::AppState;
use crate::session_store::SessionStore;

async fn test_server() -> (TestServer, Arc<AppState>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::parse_from(["engine", "--control-dir", dir.path().to_str().unwrap(), "--port", "0"]);
    let (store, _recovery) = SessionStore::new(config.control_dir.clone(), config.max_sessions).await.unwrap();
    let state = Arc::new(AppState { store, config: Arc::new(config), shutdown: CancellationToken::new() });
    let server = TestServer::new(router(state.clone())).unwrap();
    (server, state, dir)
}

#[tokio::test]
async fn health_returns_ok_status() {
    let (server, _state, _dir) = test_server().await;
    let response = server.get("/api/health").await;
    response.assert_status_ok();
}

#[tokio::test]
async fn create_session_rejects_empty_command() {
    let (server, _state, _dir) = test_server().await;
    let response = server.post("/api/sessions").json(&serde_json::json!({ "command": [] })).await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_session_spawns_and_registers_a_real_process() {
    let (server, state, _dir) = test_server().await;
    let response = server
        .post("/api/sessions")
        .json(&serde_json::json!({ "command": ["/bin/sh", "-c", "sleep 5"], "cols": 80, "rows": 24 }))
        .await;
    response.assert_status(axum::http::StatusCode::CREATED);
    let body: serde_json::Value = response.json();
    let id = body["id"].as_str().unwrap().to_owned();

    assert!(state.store.get(&id).await.is_some());

    let list = server.get("/api/sessions").await;
    list.assert_status_ok();
    let sessions: Vec<serde_json::Value> = list.json();
    assert!(sessions.iter().any(|s| s["id"] == id));

    let snapshot = server.get(&format!("/api/sessions/{id}/snapshot")).await;
    snapshot.assert_status_ok();

    let kill = server.delete(&format!("/api/sessions/{id}")).await;
    kill.assert_status(axum::http::StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn operations_on_unknown_session_return_not_found() {
    let (server, _state, _dir) = test_server().await;
    let response = server.get("/api/sessions/does-not-exist/snapshot").await;
    response.assert_status(axum::http::StatusCode::NOT_FOUND);

    let response = server.post("/api/sessions/does-not-exist/resize").json(&serde_json::json!({"cols":80,"rows":24})).await;
    response.assert_status(axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn external_session_binds_an_ipc_socket_instead_of_spawning() {
    let (server, state, _dir) = test_server().await;
    let response = server
        .post("/api/sessions")
        .json(&serde_json::json!({ "command": ["bash"], "external": true, "cols": 80, "rows": 24 }))
        .await;
    response.assert_status(axum::http::StatusCode::CREATED);
    let body: serde_json::Value = response.json();
    let id = body["id"].as_str().unwrap().to_owned();

    let session = state.store.get(&id).await.unwrap();
    assert!(session.child_pid().is_none());

    let metadata = state.store.metadata(&id).await.unwrap();
    assert_eq!(metadata.source, crate::session_store::SessionSource::External);

    let socket = crate::external_ingest::socket_path(&state.store.session_dir(&id));
    assert!(socket.exists());
}

#[tokio::test]
async fn input_is_delivered_to_a_running_session() {
    let (server, _state, _dir) = test_server().await;
    let create = server
        .post("/api/sessions")
        .json(&serde_json::json!({ "command": ["/bin/cat"], "cols": 80, "rows": 24 }))
        .await;
    create.assert_status(axum::http::StatusCode::CREATED);
    let body: serde_json::Value = create.json();
    let id = body["id"].as_str().unwrap().to_owned();

    let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"hello\n");
    let response = server.post(&format!("/api/sessions/{id}/input")).json(&serde_json::json!({ "data": encoded })).await;
    response.assert_status(axum::http::StatusCode::NO_CONTENT);
}
