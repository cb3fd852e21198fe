// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error codes shared across the WebSocket protocol and the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    BadFrame,
    FrameTooLarge,
    UnknownType,
    Unauthorized,
    BadRequest,
    SessionNotFound,
    SessionGone,
    SpawnFailed,
    PtyIo,
    CastIo,
    SlowConsumer,
    ResourceExhausted,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadFrame => 400,
            Self::FrameTooLarge => 413,
            Self::UnknownType => 400,
            Self::Unauthorized => 401,
            Self::BadRequest => 400,
            Self::SessionNotFound => 404,
            Self::SessionGone => 410,
            Self::SpawnFailed => 500,
            Self::PtyIo => 500,
            Self::CastIo => 500,
            Self::SlowConsumer => 429,
            Self::ResourceExhausted => 429,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadFrame => "BAD_FRAME",
            Self::FrameTooLarge => "FRAME_TOO_LARGE",
            Self::UnknownType => "UNKNOWN_TYPE",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest => "BAD_REQUEST",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionGone => "SESSION_GONE",
            Self::SpawnFailed => "SPAWN_FAILED",
            Self::PtyIo => "PTY_IO",
            Self::CastIo => "CAST_IO",
            Self::SlowConsumer => "SLOW_CONSUMER",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
