// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::event::PtySignal;
use crate::pty::{Backend, BackendInput, ExitStatus};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct NoopBackend;

impl Backend for NoopBackend {
    fn run(
        &mut self,
        _output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<BackendInput>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ExitStatus>> + Send + '_>> {
        Box::pin(async move {
            while input_rx.recv().await.is_some() {}
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
        None
    }
}

fn spawn_session(id: &str) -> Arc<PtySession> {
    // Leak the tempdir's path (not its handle) so the cast log file outlives
    // this helper; cleanup is not the concern of this test.
    let dir = tempfile::tempdir().unwrap().into_path();
    let cast_log = Arc::new(
        crate::cast_log::CastLog::create(
            dir.join("stdout"),
            crate::pty_session::initial_header(&["sh".to_owned()], 80, 24),
            65536,
        )
        .unwrap(),
    );
    let hub = Arc::new(crate::stream_hub::StreamHub::new(id.to_owned()));
    let (session, _join) = PtySession::start(crate::pty_session::PtySessionConfig {
        id: id.to_owned(),
        backend: Box::new(NoopBackend),
        cast_log,
        hub,
        cols: 80,
        rows: 24,
        shutdown: CancellationToken::new(),
    });
    session
}

#[tokio::test]
async fn register_list_get_and_remove_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let (store, summary) = SessionStore::new(root.path().to_owned(), 0).await.unwrap();
    assert_eq!(summary, RecoverySummary::default());

    let session = spawn_session("sess-a");
    let metadata = new_metadata("sess-a".to_owned(), vec!["sh".to_owned()], 80, 24, session.child_pid(), SessionSource::Internal);
    store.register(metadata, session.clone()).await.unwrap();

    assert_eq!(store.len().await, 1);
    assert!(store.get("sess-a").await.is_some());
    assert_eq!(store.list().await.len(), 1);
    assert!(root.path().join("sess-a/session.json").exists());

    let removed = store.remove("sess-a").await;
    assert!(removed.is_some());
    assert_eq!(store.len().await, 0);
}

#[tokio::test]
async fn register_past_max_sessions_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let (store, _) = SessionStore::new(root.path().to_owned(), 1).await.unwrap();

    let s1 = spawn_session("sess-a");
    store.register(new_metadata("sess-a".to_owned(), vec![], 80, 24, None, SessionSource::Internal), s1).await.unwrap();

    let s2 = spawn_session("sess-b");
    let err = store.register(new_metadata("sess-b".to_owned(), vec![], 80, 24, None, SessionSource::Internal), s2).await.unwrap_err();
    assert_eq!(err, ErrorCode::ResourceExhausted);
}

#[tokio::test]
async fn recovery_sweep_marks_dead_pid_sessions_as_exited() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("sess-old");
    std::fs::create_dir_all(&dir).unwrap();
    let metadata = new_metadata("sess-old".to_owned(), vec!["bash".to_owned()], 80, 24, Some(u32::MAX - 1), SessionSource::Internal);
    std::fs::write(dir.join("session.json"), serde_json::to_string(&metadata).unwrap()).unwrap();

    let (store, summary) = SessionStore::new(root.path().to_owned(), 0).await.unwrap();
    assert_eq!(summary.recovered_exited, 1);
    assert_eq!(summary.recovered_running, 0);
    assert!(store.get("sess-old").await.is_none(), "recovered session has no live handle");
    assert!(store.metadata("sess-old").await.is_some());
}

#[tokio::test]
async fn recovery_sweep_ignores_corrupt_metadata() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("sess-broken");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("session.json"), b"not json").unwrap();

    let (store, summary) = SessionStore::new(root.path().to_owned(), 0).await.unwrap();
    assert_eq!(summary, RecoverySummary::default());
    assert_eq!(store.len().await, 0);
}
