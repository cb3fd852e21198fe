// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable, append-only Asciinema v2 recording for one session, with
//! clear-sequence pruning and offset-addressable tailing for reattach.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ring::RingBuffer;

/// First line of a cast file: session metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastHeader {
    pub version: u8,
    pub width: u16,
    pub height: u16,
    pub timestamp: u64,
    pub command: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<std::collections::BTreeMap<String, String>>,
}

/// One JSONL event line: `[t, kind, data]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "(f64, String, String)", into = "(f64, String, String)")]
pub struct CastEvent {
    pub t: f64,
    pub kind: CastEventKind,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastEventKind {
    Output,
    Input,
    Resize,
}

impl CastEventKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Output => "o",
            Self::Input => "i",
            Self::Resize => "r",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "o" => Some(Self::Output),
            "i" => Some(Self::Input),
            "r" => Some(Self::Resize),
            _ => None,
        }
    }
}

impl TryFrom<(f64, String, String)> for CastEvent {
    type Error = String;
    fn try_from((t, kind, data): (f64, String, String)) -> Result<Self, String> {
        let kind = CastEventKind::parse(&kind).ok_or_else(|| format!("unknown event kind: {kind}"))?;
        Ok(Self { t, kind, data })
    }
}

impl From<CastEvent> for (f64, String, String) {
    fn from(e: CastEvent) -> Self {
        (e.t, e.kind.as_str().to_owned(), e.data)
    }
}

/// A clear-screen-anchored reattach offset: bytes before this offset in the
/// output stream are safe to skip on replay.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearOffset(pub u64);

/// The clear-screen escape sequences pruning watches for: `ED2`/`ED3`
/// ("clear screen" / "clear screen and scrollback") and `RIS` (full reset).
fn clear_pattern() -> &'static regex::bytes::Regex {
    static PATTERN: std::sync::OnceLock<regex::bytes::Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| regex::bytes::Regex::new(r"\x1b\[[23]J|\x1bc").expect("static clear-sequence pattern"))
}

/// Byte offset just past the last clear-screen sequence found in `data`, if
/// any. Replay can skip everything before it; the terminal was reset there.
fn scan_last_clear(data: &[u8]) -> Option<usize> {
    clear_pattern().find_iter(data).last().map(|m| m.end())
}

enum WriterMsg {
    Append(String),
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Durable per-session recording: header + append-only event log, plus a
/// fast in-memory byte-offset ring for cheap short-range replay.
pub struct CastLog {
    path: PathBuf,
    header_written: std::sync::atomic::AtomicBool,
    base_instant: Instant,
    writer_tx: tokio::sync::mpsc::Sender<WriterMsg>,
    ring: Mutex<RingBuffer>,
    total_output_bytes: AtomicU64,
    tail_tx: broadcast::Sender<bytes::Bytes>,
}

impl CastLog {
    /// Open (creating if absent) the cast log at `path` for a freshly
    /// spawned session, writing the header immediately.
    pub fn create(
        path: impl Into<PathBuf>,
        header: CastHeader,
        ring_capacity: usize,
    ) -> anyhow::Result<Self> {
        let path = path.into();
        let (writer_tx, writer_rx) = tokio::sync::mpsc::channel(1024);
        spawn_writer(path.clone(), writer_rx);

        let log = Self {
            path,
            header_written: std::sync::atomic::AtomicBool::new(false),
            base_instant: Instant::now(),
            writer_tx,
            ring: Mutex::new(RingBuffer::new(ring_capacity)),
            total_output_bytes: AtomicU64::new(0),
            tail_tx: broadcast::channel(4096).0,
        };
        log.write_header(&header)?;
        Ok(log)
    }

    fn write_header(&self, header: &CastHeader) -> anyhow::Result<()> {
        if self.header_written.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let line = serde_json::to_string(header)?;
        self.writer_tx
            .try_send(WriterMsg::Append(line))
            .map_err(|_| anyhow::anyhow!("cast log writer queue full"))?;
        Ok(())
    }

    fn elapsed_secs(&self) -> f64 {
        self.base_instant.elapsed().as_secs_f64()
    }

    fn enqueue(&self, event: CastEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            let _ = self.writer_tx.try_send(WriterMsg::Append(line));
        }
    }

    /// Append output bytes. Scans for clear-screen sequences to advance the
    /// pruning anchor, updates the in-memory ring, and wakes tailers.
    pub fn append_output(&self, data: &[u8]) {
        let text = String::from_utf8_lossy(data).into_owned();
        self.enqueue(CastEvent { t: self.elapsed_secs(), kind: CastEventKind::Output, data: text });

        let base = self.total_output_bytes.fetch_add(data.len() as u64, Ordering::SeqCst);
        let clear_at = scan_last_clear(data);

        {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            ring.write(data);
            if let Some(clear_at) = clear_at {
                ring.note_clear(base + clear_at as u64);
            }
        }
        let _ = self.tail_tx.send(bytes::Bytes::copy_from_slice(data));
    }

    /// Append an input event (stdin) for audit/replay purposes.
    pub fn append_input(&self, data: &[u8]) {
        let text = String::from_utf8_lossy(data).into_owned();
        self.enqueue(CastEvent { t: self.elapsed_secs(), kind: CastEventKind::Input, data: text });
    }

    /// Append a resize event.
    pub fn append_resize(&self, cols: u16, rows: u16) {
        self.enqueue(CastEvent {
            t: self.elapsed_secs(),
            kind: CastEventKind::Resize,
            data: format!("{cols}x{rows}"),
        });
    }

    /// Append the terminal exit sentinel and flush pending writes.
    pub async fn append_exit(&self, code: Option<i32>, session_id: &str) {
        let line = format!(
            "[\"exit\",{},{}]",
            code.map(|c| c.to_string()).unwrap_or_else(|| "null".to_string()),
            serde_json::to_string(session_id).unwrap_or_else(|_| "\"\"".to_string())
        );
        let _ = self.writer_tx.send(WriterMsg::Append(line)).await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self.writer_tx.send(WriterMsg::Flush(tx)).await.is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(2), rx).await;
        }
    }

    /// Byte offset before which a clear-screen sequence makes replay safe
    /// to skip.
    pub fn last_clear_offset(&self) -> u64 {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.clear_floor()
    }

    /// Total output bytes ever appended (monotonic, not reset by pruning).
    pub fn total_output_bytes(&self) -> u64 {
        self.total_output_bytes.load(Ordering::SeqCst)
    }

    /// The canonical reattach offset: the later of the caller's last-known
    /// offset and the pruning anchor.
    pub fn reattach_offset(&self, from_offset: u64) -> u64 {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.reattach_offset(from_offset)
    }

    /// Read whatever is available in the fast in-memory ring starting at
    /// `offset`. Returns `None` if the offset has fallen out of the ring's
    /// window (caller should fall back to `read_file_from`).
    pub fn read_ring_from(&self, offset: u64) -> Option<Vec<u8>> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.read_from(offset).map(|(a, b)| [a, b].concat())
    }

    /// Re-read the on-disk cast file and return the output bytes recorded
    /// at or after `offset`. Used when the ring's window has rolled past
    /// the requested offset (cold reattach, long disconnect, or restart).
    pub fn read_file_from(&self, offset: u64) -> std::io::Result<Vec<u8>> {
        let file = std::fs::File::open(&self.path)?;
        let reader = std::io::BufReader::new(file);
        let mut seen: u64 = 0;
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let Ok(event) = serde_json::from_str::<CastEvent>(&line) else { continue };
            if event.kind != CastEventKind::Output {
                continue;
            }
            let bytes = event.data.as_bytes();
            let start = seen;
            let end = seen + bytes.len() as u64;
            if end > offset {
                let skip = offset.saturating_sub(start) as usize;
                out.extend_from_slice(&bytes[skip.min(bytes.len())..]);
            }
            seen = end;
        }
        Ok(out)
    }

    /// Subscribe to live output appended from this point forward.
    pub fn tail(&self) -> broadcast::Receiver<bytes::Bytes> {
        self.tail_tx.subscribe()
    }

    /// Reads from the ring or file at `self.reattach_offset(from_offset)`,
    /// then chains into live appends: the `tail` operation's full contract
    /// as one continuous async byte stream, replay followed by live.
    ///
    /// Subscribing before reading history means no bytes appended between
    /// the two steps are lost, at the cost of possibly re-delivering a few
    /// bytes the history read already covered; callers that care about
    /// exact dedup should track the offset themselves.
    pub fn tail_stream(&self, from_offset: u64) -> impl futures_util::Stream<Item = bytes::Bytes> + Send + 'static {
        use futures_util::StreamExt;

        let live = tokio_stream::wrappers::BroadcastStream::new(self.tail())
            .filter_map(|item| futures_util::future::ready(item.ok()));

        let offset = self.reattach_offset(from_offset);
        let history = self
            .read_ring_from(offset)
            .or_else(|| self.read_file_from(offset).ok())
            .unwrap_or_default();

        futures_util::stream::once(futures_util::future::ready(bytes::Bytes::from(history))).chain(live)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn spawn_writer(path: PathBuf, mut rx: tokio::sync::mpsc::Receiver<WriterMsg>) {
    tokio::task::spawn_blocking(move || {
        let mut file = match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to open cast log");
                return;
            }
        };
        while let Some(msg) = rx.blocking_recv() {
            match msg {
                WriterMsg::Append(line) => {
                    if let Err(e) = writeln!(file, "{line}") {
                        tracing::warn!(path = %path.display(), error = %e, "cast log append failed");
                    }
                }
                WriterMsg::Flush(done) => {
                    let _ = file.flush();
                    let _ = done.send(());
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "cast_log_tests.rs"]
mod tests;
