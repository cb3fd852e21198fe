// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session index: create/list/get/destroy, `session.json` persistence, a
//! startup recovery sweep against `/proc` pid liveness, and the resource
//! caps that gate session creation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::ErrorCode;
use crate::pty_session::PtySession;

/// Where a session's I/O comes from: an internally-spawned PTY, or an
/// external forwarder process talking to `ipc.sock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    Internal,
    External,
}

/// Persisted session metadata, the contents of `session.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    pub command: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub created_at: u64,
    pub pid: Option<u32>,
    #[serde(default = "default_source")]
    pub source: SessionSource,
}

fn default_source() -> SessionSource {
    SessionSource::Internal
}

/// One entry in the store: durable metadata plus the live session handle,
/// once it exists. A session recovered at startup whose process is gone
/// has `live: None` and is reported as already exited.
struct Entry {
    metadata: SessionMetadata,
    live: Option<Arc<PtySession>>,
}

/// Summary returned from [`SessionStore::new`]'s recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub recovered_running: usize,
    pub recovered_exited: usize,
}

pub struct SessionStore {
    control_dir: PathBuf,
    max_sessions: usize,
    entries: RwLock<IndexMap<String, Entry>>,
}

impl SessionStore {
    /// Build the store and run the startup recovery sweep: scan
    /// `control_dir` for session directories, reconcile each `session.json`
    /// against `/proc` pid liveness, and log a summary.
    ///
    /// A session whose recorded pid is no longer alive is recorded as
    /// already exited; its directory and cast log are left in place for
    /// replay, it is just not resumable as a live session.
    pub async fn new(control_dir: PathBuf, max_sessions: usize) -> anyhow::Result<(Arc<Self>, RecoverySummary)> {
        std::fs::create_dir_all(&control_dir)?;

        let mut entries = IndexMap::new();
        let mut summary = RecoverySummary::default();

        let dir_iter = match std::fs::read_dir(&control_dir) {
            Ok(it) => it,
            Err(e) => {
                warn!(error = %e, "failed to scan control dir for recovery sweep");
                return Ok((
                    Arc::new(Self { control_dir, max_sessions, entries: RwLock::new(entries) }),
                    summary,
                ));
            }
        };

        for dirent in dir_iter.flatten() {
            let path = dirent.path();
            if !path.is_dir() {
                continue;
            }
            let meta_path = path.join("session.json");
            let Ok(raw) = std::fs::read_to_string(&meta_path) else { continue };
            let Ok(metadata) = serde_json::from_str::<SessionMetadata>(&raw) else {
                warn!(path = %meta_path.display(), "skipping unreadable session.json during recovery");
                continue;
            };

            let alive = metadata.pid.map(pid_is_alive).unwrap_or(false);
            if alive {
                summary.recovered_running += 1;
            } else {
                summary.recovered_exited += 1;
            }
            entries.insert(metadata.id.clone(), Entry { metadata, live: None });
        }

        info!(
            running = summary.recovered_running,
            exited = summary.recovered_exited,
            "session recovery sweep complete"
        );

        Ok((Arc::new(Self { control_dir, max_sessions, entries: RwLock::new(entries) }), summary))
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.control_dir.join(session_id)
    }

    /// Reserve a slot for a new session, failing with `ResourceExhausted`
    /// once `max_sessions` is reached, and persist its metadata.
    pub async fn register(&self, metadata: SessionMetadata, session: Arc<PtySession>) -> Result<(), ErrorCode> {
        let mut entries = self.entries.write().await;
        if self.max_sessions != 0 && entries.len() >= self.max_sessions {
            return Err(ErrorCode::ResourceExhausted);
        }

        let dir = self.session_dir(&metadata.id);
        std::fs::create_dir_all(&dir).map_err(|_| ErrorCode::Internal)?;
        write_metadata(&dir, &metadata).map_err(|_| ErrorCode::Internal)?;

        entries.insert(metadata.id.clone(), Entry { metadata, live: Some(session) });
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<PtySession>> {
        self.entries.read().await.get(session_id).and_then(|e| e.live.clone())
    }

    pub async fn metadata(&self, session_id: &str) -> Option<SessionMetadata> {
        self.entries.read().await.get(session_id).map(|e| e.metadata.clone())
    }

    pub async fn list(&self) -> Vec<SessionMetadata> {
        self.entries.read().await.values().map(|e| e.metadata.clone()).collect()
    }

    /// Remove a session from the index. Does not itself terminate the
    /// child process — callers signal the session before calling this.
    pub async fn remove(&self, session_id: &str) -> Option<Arc<PtySession>> {
        self.entries.write().await.shift_remove(session_id).and_then(|e| e.live)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

fn write_metadata(dir: &Path, metadata: &SessionMetadata) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(dir.join("session.json"), json)
}

/// Build fresh session metadata for a just-spawned session.
pub fn new_metadata(
    id: String,
    command: Vec<String>,
    cols: u16,
    rows: u16,
    pid: Option<u32>,
    source: SessionSource,
) -> SessionMetadata {
    SessionMetadata {
        id,
        command,
        cols,
        rows,
        created_at: SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0),
        pid,
        source,
    }
}

/// Whether a pid is still alive, via `/proc/<pid>` on Linux. Conservative:
/// any error (including "not Linux") is treated as "can't tell, assume
/// exited" since a recovered session with a dead pid is the safe default.
fn pid_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
#[path = "session_store_tests.rs"]
mod tests;
