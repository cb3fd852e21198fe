// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Owns one PTY (or external-ingest) backend and its child process: reads
//! output into the cast log, emulator, and stream hub; serializes writes
//! through a bounded queue; tracks exit.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::cast_log::{CastHeader, CastLog};
use crate::event::{HubEvent, PtySignal};
use crate::pty::{Backend, BackendInput, ExitStatus};
use crate::stream_hub::StreamHub;
use crate::vt_emulator::VtEmulator;

/// Write-queue depth before [`PtySession::send_input`] starts rejecting
/// non-interactive sources. Interactive WebSocket input is never rejected
/// by this queue — callers apply their own priority before enqueuing.
const INPUT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

pub struct PtySessionConfig {
    pub id: String,
    pub backend: Box<dyn Backend>,
    pub cast_log: Arc<CastLog>,
    pub hub: Arc<StreamHub>,
    pub cols: u16,
    pub rows: u16,
    pub shutdown: CancellationToken,
}

/// Handle to a running session's write/resize/signal interface, plus its
/// shared, lock-protected bookkeeping fields.
pub struct PtySession {
    pub id: String,
    input_tx: mpsc::Sender<BackendInput>,
    child_pid: AtomicU32,
    status: RwLock<SessionStatus>,
    exit_status: RwLock<Option<ExitStatus>>,
    cols: AtomicU32,
    rows: AtomicU32,
    vt: RwLock<VtEmulator>,
    cast_log: Arc<CastLog>,
    hub: Arc<StreamHub>,
    bytes_written: AtomicU64,
}

impl PtySession {
    /// Spawn the backend's run loop and return the session handle plus a
    /// join handle for the backend task.
    pub fn start(config: PtySessionConfig) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let PtySessionConfig { id, mut backend, cast_log, hub, cols, rows, shutdown } = config;

        let child_pid = backend.child_pid().unwrap_or(0);
        let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(512);
        let (input_tx, input_rx) = mpsc::channel::<BackendInput>(INPUT_QUEUE_CAPACITY);

        let session = Arc::new(Self {
            id: id.clone(),
            input_tx,
            child_pid: AtomicU32::new(child_pid),
            status: RwLock::new(SessionStatus::Starting),
            exit_status: RwLock::new(None),
            cols: AtomicU32::new(cols as u32),
            rows: AtomicU32::new(rows as u32),
            vt: RwLock::new(VtEmulator::new(cols, rows)),
            cast_log,
            hub,
            bytes_written: AtomicU64::new(0),
        });

        let backend_session = session.clone();
        let join = tokio::spawn(async move {
            let run_fut = backend.run(output_tx, input_rx);
            tokio::pin!(run_fut);

            *backend_session.status.write().await = SessionStatus::Running;

            let exit = loop {
                tokio::select! {
                    biased;
                    result = &mut run_fut => {
                        break result;
                    }
                    Some(data) = output_rx.recv() => {
                        backend_session.ingest_output(&data).await;
                    }
                    _ = shutdown.cancelled() => {
                        let _ = backend_session.signal(PtySignal::Term);
                        tokio::select! {
                            result = &mut run_fut => break result,
                            _ = tokio::time::sleep(Duration::from_millis(1500)) => {
                                let _ = backend_session.signal(PtySignal::Kill);
                                break run_fut.await;
                            }
                        }
                    }
                }
            };

            // Drain any output produced between the backend's final read
            // and task exit.
            while let Ok(data) = output_rx.try_recv() {
                backend_session.ingest_output(&data).await;
            }

            let status = exit.unwrap_or(ExitStatus { code: None, signal: None });
            *backend_session.exit_status.write().await = Some(status);
            *backend_session.status.write().await = SessionStatus::Exited;
            backend_session.cast_log.append_exit(status.code, &backend_session.id).await;
            backend_session
                .hub
                .publish_exit(HubEvent::Exit { code: status.code, signal: status.signal })
                .await;
        });

        (session, join)
    }

    async fn ingest_output(&self, data: &[u8]) {
        self.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.cast_log.append_output(data);
        let (bell, title) = {
            let mut vt = self.vt.write().await;
            vt.feed(data);
            (vt.take_bell(), vt.title().to_owned())
        };
        self.hub.publish_stdout(Bytes::copy_from_slice(data)).await;
        if bell {
            self.hub.publish_event(HubEvent::Bell).await;
        }
        if !title.is_empty() {
            self.hub.publish_event(HubEvent::Title(title)).await;
        }
    }

    /// Enqueue stdin bytes. Returns an error if the write queue is full —
    /// callers decide how to prioritize against that backpressure signal.
    pub fn send_input(&self, data: Bytes) -> Result<(), crate::error::ErrorCode> {
        self.cast_log.append_input(&data);
        self.input_tx.try_send(BackendInput::Write(data)).map_err(|_| crate::error::ErrorCode::PtyIo)
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), crate::error::ErrorCode> {
        self.cols.store(cols as u32, Ordering::Relaxed);
        self.rows.store(rows as u32, Ordering::Relaxed);
        self.vt.write().await.resize(cols, rows);
        self.cast_log.append_resize(cols, rows);
        self.input_tx
            .send(BackendInput::Resize { cols, rows })
            .await
            .map_err(|_| crate::error::ErrorCode::PtyIo)
    }

    pub fn signal(&self, signal: PtySignal) -> Result<(), crate::error::ErrorCode> {
        self.input_tx.try_send(BackendInput::Signal(signal)).map_err(|_| crate::error::ErrorCode::PtyIo)
    }

    pub async fn status(&self) -> SessionStatus {
        *self.status.read().await
    }

    pub async fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit_status.read().await
    }

    pub fn child_pid(&self) -> Option<u32> {
        let pid = self.child_pid.load(Ordering::Relaxed);
        (pid != 0).then_some(pid)
    }

    pub fn dimensions(&self) -> (u16, u16) {
        (self.cols.load(Ordering::Relaxed) as u16, self.rows.load(Ordering::Relaxed) as u16)
    }

    pub async fn snapshot(&self, max_scrollback_lines: usize) -> crate::snapshot::VtSnapshot {
        self.vt.read().await.snapshot(max_scrollback_lines)
    }

    pub fn cast_log(&self) -> &Arc<CastLog> {
        &self.cast_log
    }

    pub fn hub(&self) -> &Arc<StreamHub> {
        &self.hub
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

/// Build the initial cast log header for a freshly-spawned command.
pub fn initial_header(command: &[String], cols: u16, rows: u16) -> CastHeader {
    CastHeader {
        version: 2,
        width: cols,
        height: rows,
        timestamp: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        command: command.join(" "),
        title: String::new(),
        env: None,
    }
}

/// Where a session's durable state lives on disk.
pub fn session_dir(control_dir: &std::path::Path, session_id: &str) -> PathBuf {
    control_dir.join(session_id)
}

#[cfg(test)]
#[path = "pty_session_tests.rs"]
mod tests;
