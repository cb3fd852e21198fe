// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// Authentication mode for the WebSocket and HTTP surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum AuthMode {
    /// No authentication; only safe for a trusted local network.
    None,
    /// Require a bearer token matching `LOCAL_BYPASS_TOKEN`.
    Token,
    /// Delegate to the host's local user/session (e.g. a Unix peer-credential check).
    System,
}

/// Remote-terminal multiplexing server.
#[derive(Debug, Parser)]
#[command(name = "engine", version, about)]
pub struct Config {
    /// Root directory holding per-session state (session.json, cast logs, sockets).
    #[arg(long, env = "CONTROL_DIR")]
    pub control_dir: PathBuf,

    /// HTTP/WebSocket port to listen on.
    #[arg(long, env = "PORT", default_value = "4020")]
    pub port: u16,

    /// Address to bind to.
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1")]
    pub bind_addr: String,

    /// Authentication mode.
    #[arg(long, env = "AUTH_MODE", value_enum, default_value = "none")]
    pub auth_mode: AuthMode,

    /// Bearer token accepted when `--auth-mode token` is set.
    #[arg(long, env = "LOCAL_BYPASS_TOKEN")]
    pub local_bypass_token: Option<String>,

    /// Health-check-only HTTP port, separate from the main listener.
    #[arg(long, env = "ENGINE_HEALTH_PORT")]
    pub health_port: Option<u16>,

    /// Log format (json or text).
    #[arg(long, env = "ENGINE_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "ENGINE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Maximum concurrent sessions. 0 means unlimited.
    #[arg(long, env = "ENGINE_MAX_SESSIONS", default_value = "256")]
    pub max_sessions: usize,

    /// Maximum accepted frame size, in bytes.
    #[arg(long, env = "ENGINE_MAX_FRAME_SIZE", default_value = "10485760")]
    pub max_frame_size: usize,

    /// In-memory ring buffer size per session, in bytes.
    #[arg(long, env = "ENGINE_RING_SIZE", default_value = "1048576")]
    pub ring_size: usize,

    /// Per-subscriber outbox low watermark (queued messages).
    #[arg(long, env = "ENGINE_OUTBOX_LOW_WATERMARK", default_value = "64")]
    pub outbox_low_watermark: usize,

    /// Per-subscriber outbox high watermark (queued messages).
    #[arg(long, env = "ENGINE_OUTBOX_HIGH_WATERMARK", default_value = "256")]
    pub outbox_high_watermark: usize,

    /// Per-subscriber outbox hard cap before disconnect.
    #[arg(long, env = "ENGINE_OUTBOX_HARD_CAP", default_value = "2048")]
    pub outbox_hard_cap: usize,

    /// Minimum interval between snapshots sent to one subscriber, in milliseconds.
    #[arg(long, env = "ENGINE_SNAPSHOT_MIN_INTERVAL_MS", default_value = "100")]
    pub snapshot_min_interval_ms: u64,

    /// Maximum interval before a subscriber is due a fresh snapshot, in milliseconds.
    #[arg(long, env = "ENGINE_SNAPSHOT_MAX_INTERVAL_MS", default_value = "5000")]
    pub snapshot_max_interval_ms: u64,

    /// Default terminal columns for newly-created sessions.
    #[arg(long, env = "ENGINE_DEFAULT_COLS", default_value = "80")]
    pub default_cols: u16,

    /// Default terminal rows for newly-created sessions.
    #[arg(long, env = "ENGINE_DEFAULT_ROWS", default_value = "24")]
    pub default_rows: u16,

    /// TERM environment variable passed to spawned children.
    #[arg(long, env = "ENGINE_TERM", default_value = "xterm-256color")]
    pub term: String,
}

impl Config {
    /// Validate cross-field invariants the type system can't express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth_mode == AuthMode::Token && self.local_bypass_token.is_none() {
            anyhow::bail!("--auth-mode token requires --local-bypass-token");
        }
        if self.outbox_low_watermark > self.outbox_high_watermark {
            anyhow::bail!("outbox low watermark must not exceed the high watermark");
        }
        if self.outbox_high_watermark > self.outbox_hard_cap {
            anyhow::bail!("outbox high watermark must not exceed the hard cap");
        }
        if self.snapshot_min_interval_ms > self.snapshot_max_interval_ms {
            anyhow::bail!("snapshot min interval must not exceed the max interval");
        }
        Ok(())
    }

    pub fn watermarks(&self) -> crate::stream_hub::Watermarks {
        crate::stream_hub::Watermarks {
            low: self.outbox_low_watermark,
            high: self.outbox_high_watermark,
            hard_cap: self.outbox_hard_cap,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
