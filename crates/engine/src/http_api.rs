// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP control surface: session lifecycle, one-shot snapshot fetch, and
//! non-streaming input/resize for callers that don't need the WebSocket.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::external_ingest::ExternalBackend;
use crate::pty::spawn::NativePty;
use crate::pty::Boxed;
use crate::pty_session::{initial_header, PtySession, PtySessionConfig};
use crate::run::AppState;
use crate::session_store::{new_metadata, SessionMetadata, SessionSource};
use crate::stream_hub::StreamHub;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}/snapshot", get(snapshot))
        .route("/api/sessions/{id}/input", post(input))
        .route("/api/sessions/{id}/resize", post(resize))
        .route("/api/sessions/{id}", delete(kill_session))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

fn error_response(code: ErrorCode, message: impl Into<String>) -> Response {
    let status = StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorBody { code: code.as_str(), message: message.into() })).into_response()
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.list().await)
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    command: Vec<String>,
    #[serde(default)]
    cols: Option<u16>,
    #[serde(default)]
    rows: Option<u16>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: Vec<(String, String)>,
    /// When set, the session's I/O comes from an `ipc.sock` forwarder
    /// (§6's CLI wrapper) instead of an internally-spawned PTY. `command`
    /// is still recorded as metadata, naming the program the wrapper runs.
    #[serde(default)]
    external: bool,
}

#[derive(Debug, Serialize)]
struct CreateSessionResponse {
    id: String,
}

async fn create_session(State(state): State<Arc<AppState>>, Json(req): Json<CreateSessionRequest>) -> Response {
    if req.command.is_empty() {
        return error_response(ErrorCode::BadRequest, "command must not be empty");
    }
    let cols = req.cols.unwrap_or(state.config.default_cols);
    let rows = req.rows.unwrap_or(state.config.default_rows);
    let id = uuid::Uuid::new_v4().to_string();

    let session_dir = state.store.session_dir(&id);
    if let Err(e) = std::fs::create_dir_all(&session_dir) {
        return error_response(ErrorCode::Internal, e.to_string());
    }

    let source = if req.external { SessionSource::External } else { SessionSource::Internal };
    let backend = if req.external {
        match ExternalBackend::bind(crate::external_ingest::socket_path(&session_dir)) {
            Ok(backend) => backend.boxed(),
            Err(e) => return error_response(ErrorCode::SpawnFailed, e.to_string()),
        }
    } else {
        match NativePty::spawn(&req.command, cols, rows, &state.config.term, req.cwd.as_ref().map(std::path::Path::new), &req.env) {
            Ok(backend) => backend.boxed(),
            Err(e) => return error_response(ErrorCode::SpawnFailed, e.to_string()),
        }
    };

    let cast_log = match crate::cast_log::CastLog::create(
        session_dir.join("stdout"),
        initial_header(&req.command, cols, rows),
        state.config.ring_size,
    ) {
        Ok(log) => Arc::new(log),
        Err(e) => return error_response(ErrorCode::CastIo, e.to_string()),
    };

    let hub = Arc::new(StreamHub::new(id.clone()));
    let child_pid = backend.child_pid();
    let (session, _join) = PtySession::start(PtySessionConfig {
        id: id.clone(),
        backend,
        cast_log,
        hub,
        cols,
        rows,
        shutdown: state.shutdown.clone(),
    });

    let metadata: SessionMetadata = new_metadata(id.clone(), req.command, cols, rows, child_pid, source);
    if let Err(code) = state.store.register(metadata, session).await {
        return error_response(code, "session limit reached");
    }

    (StatusCode::CREATED, Json(CreateSessionResponse { id })).into_response()
}

async fn snapshot(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Some(session) = state.store.get(&id).await else {
        return error_response(ErrorCode::SessionNotFound, "no such session");
    };
    let snapshot = session.snapshot(usize::MAX).await;
    (StatusCode::OK, crate::snapshot::encode(&snapshot)).into_response()
}

#[derive(Debug, Deserialize)]
struct InputRequest {
    #[serde(with = "base64_bytes")]
    data: Vec<u8>,
}

async fn input(State(state): State<Arc<AppState>>, Path(id): Path<String>, Json(req): Json<InputRequest>) -> Response {
    let Some(session) = state.store.get(&id).await else {
        return error_response(ErrorCode::SessionNotFound, "no such session");
    };
    match session.send_input(bytes::Bytes::from(req.data)) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(code) => error_response(code, "failed to enqueue input"),
    }
}

#[derive(Debug, Deserialize)]
struct ResizeRequest {
    cols: u16,
    rows: u16,
}

async fn resize(State(state): State<Arc<AppState>>, Path(id): Path<String>, Json(req): Json<ResizeRequest>) -> Response {
    let Some(session) = state.store.get(&id).await else {
        return error_response(ErrorCode::SessionNotFound, "no such session");
    };
    match session.resize(req.cols, req.rows).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(code) => error_response(code, "failed to resize"),
    }
}

async fn kill_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Some(session) = state.store.get(&id).await else {
        return error_response(ErrorCode::SessionNotFound, "no such session");
    };
    match session.signal(crate::event::PtySignal::Term) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(code) => error_response(code, "failed to signal session"),
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[path = "http_api_tests.rs"]
mod tests;
