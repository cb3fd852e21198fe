// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::pty::BackendInput;
use std::future::Future;
use std::pin::Pin;

/// Deterministic in-memory backend for exercising `PtySession` without a
/// real PTY: echoes every `Write` back as output, exits when input closes.
struct EchoBackend {
    resizes: Arc<std::sync::Mutex<Vec<(u16, u16)>>>,
}

impl Backend for EchoBackend {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<BackendInput>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ExitStatus>> + Send + '_>> {
        let resizes = self.resizes.clone();
        Box::pin(async move {
            output_tx.send(Bytes::from_static(b"banner\n")).await.ok();
            loop {
                match input_rx.recv().await {
                    Some(BackendInput::Write(data)) => {
                        let _ = output_tx.send(data).await;
                    }
                    Some(BackendInput::Resize { cols, rows }) => {
                        resizes.lock().unwrap().push((cols, rows));
                    }
                    Some(BackendInput::Signal(PtySignal::Kill)) => break,
                    Some(BackendInput::Signal(_)) => {}
                    Some(BackendInput::Drain(done)) => {
                        let _ = done.send(());
                    }
                    None => break,
                }
            }
            Ok(ExitStatus { code: Some(0), signal: None })
        })
    }

    fn resize(&self, _cols: u16, _rows: u16) -> anyhow::Result<()> {
        Ok(())
    }

    fn signal(&self, _signal: PtySignal) -> anyhow::Result<()> {
        Ok(())
    }

    fn child_pid(&self) -> Option<u32> {
        Some(4242)
    }
}

fn test_hub() -> Arc<StreamHub> {
    Arc::new(StreamHub::new("sess-echo".to_owned()))
}

fn test_cast_log(dir: &tempfile::TempDir) -> Arc<CastLog> {
    Arc::new(
        CastLog::create(
            dir.path().join("stdout"),
            initial_header(&["echo".to_owned()], 80, 24),
            65536,
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn ingests_backend_output_into_cast_log_and_emulator() {
    let dir = tempfile::tempdir().unwrap();
    let cast_log = test_cast_log(&dir);
    let hub = test_hub();
    let resizes = Arc::new(std::sync::Mutex::new(Vec::new()));

    let (session, _join) = PtySession::start(PtySessionConfig {
        id: "sess-echo".to_owned(),
        backend: Box::new(EchoBackend { resizes: resizes.clone() }),
        cast_log: cast_log.clone(),
        hub,
        cols: 80,
        rows: 24,
        shutdown: CancellationToken::new(),
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.status().await, SessionStatus::Running);
    assert!(session.bytes_written() >= "banner\n".len() as u64);

    session.send_input(Bytes::from_static(b"echo hi\n")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.bytes_written() >= "banner\necho hi\n".len() as u64);
}

#[tokio::test]
async fn resize_updates_dimensions_and_records_event() {
    let dir = tempfile::tempdir().unwrap();
    let cast_log = test_cast_log(&dir);
    let hub = test_hub();
    let resizes = Arc::new(std::sync::Mutex::new(Vec::new()));

    let (session, _join) = PtySession::start(PtySessionConfig {
        id: "sess-echo".to_owned(),
        backend: Box::new(EchoBackend { resizes: resizes.clone() }),
        cast_log,
        hub,
        cols: 80,
        rows: 24,
        shutdown: CancellationToken::new(),
    });

    session.resize(120, 40).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.dimensions(), (120, 40));
    assert_eq!(resizes.lock().unwrap().as_slice(), &[(120, 40)]);
}

#[tokio::test]
async fn shutdown_token_drives_session_to_exited() {
    let dir = tempfile::tempdir().unwrap();
    let cast_log = test_cast_log(&dir);
    let hub = test_hub();
    let shutdown = CancellationToken::new();

    let (session, join) = PtySession::start(PtySessionConfig {
        id: "sess-echo".to_owned(),
        backend: Box::new(EchoBackend { resizes: Arc::new(std::sync::Mutex::new(Vec::new())) }),
        cast_log,
        hub,
        cols: 80,
        rows: 24,
        shutdown: shutdown.clone(),
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), join).await.unwrap().unwrap();
    assert_eq!(session.status().await, SessionStatus::Exited);
}
