// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer-token authentication for the HTTP surface and the WebSocket
//! upgrade, shared by `ws_router` and `http_api`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::config::AuthMode;
use crate::error::ErrorCode;
use crate::run::AppState;

/// Constant-time string comparison to avoid a timing side channel on token checks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate a Bearer token from HTTP headers against the configured auth mode.
pub fn validate_bearer(mode: AuthMode, headers: &HeaderMap, expected: Option<&str>) -> Result<(), ErrorCode> {
    if mode == AuthMode::None {
        return Ok(());
    }
    let expected = expected.ok_or(ErrorCode::Unauthorized)?;
    let header = headers.get("authorization").and_then(|v| v.to_str().ok()).ok_or(ErrorCode::Unauthorized)?;
    let token = header.strip_prefix("Bearer ").ok_or(ErrorCode::Unauthorized)?;
    if constant_time_eq(token, expected) {
        Ok(())
    } else {
        Err(ErrorCode::Unauthorized)
    }
}

/// Validate a token presented on a WebSocket upgrade, either via the
/// `Sec-WebSocket-Protocol` subprotocol parameter (`vibetunnel.v3.<token>`)
/// or a `?token=` query parameter.
pub fn validate_ws_token(mode: AuthMode, token: Option<&str>, expected: Option<&str>) -> Result<(), ErrorCode> {
    if mode == AuthMode::None {
        return Ok(());
    }
    let expected = expected.ok_or(ErrorCode::Unauthorized)?;
    match token {
        Some(t) if constant_time_eq(t, expected) => Ok(()),
        _ => Err(ErrorCode::Unauthorized),
    }
}

/// Axum middleware enforcing Bearer token auth on the HTTP surface.
/// Skips `/api/health` and the `/ws` upgrade, which authenticate themselves.
pub async fn auth_layer(State(state): State<Arc<AppState>>, req: Request<axum::body::Body>, next: Next) -> Response {
    let path = req.uri().path();
    if path == "/api/health" || path == "/ws" {
        return next.run(req).await;
    }

    if let Err(code) = validate_bearer(state.config.auth_mode, req.headers(), state.config.local_bypass_token.as_deref())
    {
        let body = serde_json::json!({ "error": { "code": code.as_str(), "message": "unauthorized" } });
        return (StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::UNAUTHORIZED), Json(body))
            .into_response();
    }

    next.run(req).await
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
