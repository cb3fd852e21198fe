// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `vt-engine` binary as a subprocess and exercises it
//! over its HTTP control surface and its binary v3 WebSocket protocol.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Once;
use std::time::Duration;

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Resolve the path to the compiled `vt-engine` binary.
pub fn engine_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("vt-engine")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `vt-engine` process that is killed on drop.
pub struct EngineProcess {
    child: Child,
    port: u16,
    health_port: Option<u16>,
    _control_dir: tempfile::TempDir,
}

/// Builder for configuring an [`EngineProcess`] before spawn.
pub struct EngineBuilder {
    health: bool,
    auth_token: Option<String>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self { health: false, auth_token: None }
    }
}

impl EngineBuilder {
    /// Enable the separate health-check-only port (`--health-port`).
    pub fn health(mut self) -> Self {
        self.health = true;
        self
    }

    /// Require a bearer token (`--auth-mode token`).
    pub fn token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_owned());
        self
    }

    /// Spawn the engine with the configured options.
    pub fn spawn(self) -> anyhow::Result<EngineProcess> {
        ensure_crypto();
        let binary = engine_binary();
        anyhow::ensure!(binary.exists(), "vt-engine binary not found at {}", binary.display());

        let control_dir = tempfile::tempdir()?;
        let port = free_port()?;
        let health_port = if self.health { Some(free_port()?) } else { None };

        let mut args: Vec<String> = vec![
            "--control-dir".into(),
            control_dir.path().to_string_lossy().into_owned(),
            "--port".into(),
            port.to_string(),
            "--bind-addr".into(),
            "127.0.0.1".into(),
            "--log-format".into(),
            "text".into(),
            "--log-level".into(),
            "warn".into(),
        ];
        if let Some(hp) = health_port {
            args.extend(["--health-port".into(), hp.to_string()]);
        }
        if let Some(ref token) = self.auth_token {
            args.extend(["--auth-mode".into(), "token".into(), "--local-bypass-token".into(), token.clone()]);
        }

        let child = Command::new(&binary).args(&args).stdout(Stdio::null()).stderr(Stdio::null()).spawn()?;

        Ok(EngineProcess { child, port, health_port, _control_dir: control_dir })
    }
}

impl EngineProcess {
    /// Create a builder for custom configuration.
    pub fn build() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Spawn the engine with the default TCP-only, no-auth configuration.
    pub fn start() -> anyhow::Result<Self> {
        Self::build().spawn()
    }

    /// Base URL for HTTP/WebSocket requests against the main listener.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// `ws://` URL for the multiplexed WebSocket endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    /// Base URL for the separate health-only port, if enabled.
    pub fn health_url(&self) -> Option<String> {
        self.health_port.map(|p| format!("http://127.0.0.1:{p}"))
    }

    /// Poll `/api/health` until it responds successfully.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let client = reqwest::Client::new();
        let url = format!("{}/api/health", self.base_url());
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("vt-engine did not become healthy within {timeout:?}");
            }
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Create a session via the HTTP control surface, returning its id.
    pub async fn create_session(&self, command: &[&str]) -> anyhow::Result<String> {
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/api/sessions", self.base_url()))
            .json(&serde_json::json!({ "command": command }))
            .send()
            .await?;
        anyhow::ensure!(resp.status().is_success(), "create_session failed: {}", resp.status());
        let body: serde_json::Value = resp.json().await?;
        Ok(body["id"].as_str().unwrap().to_owned())
    }

    /// Wait for the process to exit within `timeout`.
    pub async fn wait_exit(&mut self, timeout: Duration) -> anyhow::Result<std::process::ExitStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("vt-engine did not exit within {timeout:?}");
            }
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A SUBSCRIBE frame's 12-byte payload: flags, min and max snapshot
/// interval in milliseconds, all little-endian. Re-exported here so
/// integration tests can speak the wire protocol via the engine's own
/// `frame` module (re-exported below) instead of a second hand-rolled copy.
pub fn subscribe_payload(flags: u32, min_interval_ms: u32, max_interval_ms: u32) -> bytes::Bytes {
    subscribe_payload_with_offset(flags, min_interval_ms, max_interval_ms, 0)
}

/// A SUBSCRIBE payload carrying a reattach offset: the client's last-known
/// stream position, as an 8-byte little-endian field trailing the 12-byte
/// base payload.
pub fn subscribe_payload_with_offset(
    flags: u32,
    min_interval_ms: u32,
    max_interval_ms: u32,
    from_offset: u64,
) -> bytes::Bytes {
    use bytes::BufMut;
    let mut buf = bytes::BytesMut::with_capacity(20);
    buf.put_u32_le(flags);
    buf.put_u32_le(min_interval_ms);
    buf.put_u32_le(max_interval_ms);
    buf.put_u64_le(from_offset);
    buf.freeze()
}

pub use vt_engine::frame;
