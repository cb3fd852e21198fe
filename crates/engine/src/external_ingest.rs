// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `ipc.sock`: a per-session Unix socket that lets an external forwarder
//! process (§6's CLI wrapper) stand in for an internally-spawned PTY.
//!
//! The wire protocol is a length-prefixed frame, `u8 type + u32 len (LE) +
//! bytes`, scoped to a single session and a single peer connection. Frame
//! type 0 ("stdin-bytes") is direction-implicit: bytes the wrapper sends
//! are terminal output to publish, bytes the engine sends are input to
//! deliver to the wrapped program's stdin.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{unix::OwnedReadHalf, unix::OwnedWriteHalf, UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::event::PtySignal;
use crate::pty::{Backend, BackendInput, ExitStatus};

const TYPE_BYTES: u8 = 0;
const TYPE_CONTROL: u8 = 1;
const TYPE_STATUS: u8 = 2;

const CONTROL_RESIZE: u8 = 0;
const CONTROL_TITLE_SET: u8 = 1;

/// Wraps `stream` and a session's expected cols/rows so a resize control
/// frame can be applied without a round trip through `PtySession`.
pub struct ExternalBackend {
    listener: UnixListener,
    socket_path: PathBuf,
    child_pid: Arc<AtomicU32>,
}

impl ExternalBackend {
    /// Bind the per-session ingest socket, replacing any stale file left
    /// behind by a prior (crashed) run.
    pub fn bind(socket_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let socket_path = socket_path.into();
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path).context("bind ipc.sock")?;
        Ok(Self { listener, socket_path, child_pid: Arc::new(AtomicU32::new(0)) })
    }
}

impl Backend for ExternalBackend {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<BackendInput>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ExitStatus>> + Send + '_>> {
        Box::pin(async move {
            let (stream, _) = self.listener.accept().await.context("accept ingest connection")?;
            let (mut reader, mut writer) = stream.into_split();
            let mut recv_buf = BytesMut::new();
            let mut exit = ExitStatus { code: None, signal: None };

            loop {
                tokio::select! {
                    biased;
                    frame = read_frame(&mut reader, &mut recv_buf) => {
                        match frame? {
                            None => break,
                            Some(IngestFrame::Bytes(data)) => {
                                if output_tx.send(data).await.is_err() {
                                    break;
                                }
                            }
                            Some(IngestFrame::Resize { .. }) => {
                                // Wrapper-reported resize is informational only;
                                // PtySession's own dimensions are authoritative.
                            }
                            Some(IngestFrame::TitleSet(title)) => {
                                let osc = format!("\x1b]0;{title}\x07");
                                if output_tx.send(Bytes::from(osc.into_bytes())).await.is_err() {
                                    break;
                                }
                            }
                            Some(IngestFrame::Status { code }) => {
                                exit.code = code;
                            }
                        }
                    }
                    input = input_rx.recv() => {
                        match input {
                            Some(BackendInput::Write(data)) => {
                                write_frame(&mut writer, TYPE_BYTES, &data).await?;
                            }
                            Some(BackendInput::Resize { cols, rows }) => {
                                let mut body = Vec::with_capacity(5);
                                body.push(CONTROL_RESIZE);
                                body.put_u16_le(cols);
                                body.put_u16_le(rows);
                                write_frame(&mut writer, TYPE_CONTROL, &body).await?;
                            }
                            Some(BackendInput::Signal(_)) => {
                                // No remote signal delivery: the wrapper owns its
                                // child process directly.
                            }
                            Some(BackendInput::Drain(done)) => {
                                let _ = done.send(());
                            }
                            None => break,
                        }
                    }
                }
            }

            let _ = std::fs::remove_file(&self.socket_path);
            Ok(exit)
        })
    }

    fn resize(&self, _cols: u16, _rows: u16) -> anyhow::Result<()> {
        // Delivered via `BackendInput::Resize` inside `run`'s select loop.
        Ok(())
    }

    fn signal(&self, _signal: PtySignal) -> anyhow::Result<()> {
        Ok(())
    }

    fn child_pid(&self) -> Option<u32> {
        let pid = self.child_pid.load(Ordering::Relaxed);
        (pid != 0).then_some(pid)
    }
}

enum IngestFrame {
    Bytes(Bytes),
    Resize { cols: u16, rows: u16 },
    TitleSet(String),
    Status { code: Option<i32> },
}

async fn read_frame(reader: &mut OwnedReadHalf, buf: &mut BytesMut) -> anyhow::Result<Option<IngestFrame>> {
    let mut header = [0u8; 5];
    if reader.read_exact(&mut header).await.is_err() {
        return Ok(None);
    }
    let frame_type = header[0];
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;

    buf.clear();
    buf.resize(len, 0);
    reader.read_exact(&mut buf[..]).await.context("read ingest frame body")?;

    match frame_type {
        TYPE_BYTES => Ok(Some(IngestFrame::Bytes(Bytes::copy_from_slice(&buf[..])))),
        TYPE_CONTROL => {
            if buf.is_empty() {
                anyhow::bail!("empty control frame");
            }
            let subtype = buf[0];
            let mut body = &buf[1..];
            match subtype {
                CONTROL_RESIZE => {
                    if body.len() < 4 {
                        anyhow::bail!("truncated resize control frame");
                    }
                    let cols = body.get_u16_le();
                    let rows = body.get_u16_le();
                    Ok(Some(IngestFrame::Resize { cols, rows }))
                }
                CONTROL_TITLE_SET => Ok(Some(IngestFrame::TitleSet(String::from_utf8_lossy(body).into_owned()))),
                other => anyhow::bail!("unknown control subtype {other}"),
            }
        }
        TYPE_STATUS => {
            let code = if buf.first() == Some(&1) && buf.len() >= 5 {
                let mut rest = &buf[1..5];
                Some(rest.get_i32_le())
            } else {
                None
            };
            Ok(Some(IngestFrame::Status { code }))
        }
        other => anyhow::bail!("unknown ingest frame type {other}"),
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame_type: u8, body: &[u8]) -> anyhow::Result<()> {
    let mut header = BytesMut::with_capacity(5);
    header.put_u8(frame_type);
    header.put_u32_le(body.len() as u32);
    writer.write_all(&header).await?;
    writer.write_all(body).await?;
    Ok(())
}

/// Where a session's ingest socket lives on disk.
pub fn socket_path(session_dir: &Path) -> PathBuf {
    session_dir.join("ipc.sock")
}

/// What the engine sent down to a connected [`IngestClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineFrame {
    /// Bytes to write to the wrapped program's stdin.
    Stdin(Bytes),
    /// The engine's desired terminal size, informational for the wrapper.
    Resize { cols: u16, rows: u16 },
}

/// The wrapper side of the `ipc.sock` protocol, used by the forwarder
/// binary to register a session's terminal I/O with the engine.
pub struct IngestClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    recv_buf: BytesMut,
}

impl IngestClient {
    pub async fn connect(socket_path: &Path) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(socket_path).await.context("connect ipc.sock")?;
        let (reader, writer) = stream.into_split();
        Ok(Self { reader, writer, recv_buf: BytesMut::new() })
    }

    /// Send terminal output bytes produced by the wrapped local program.
    pub async fn send_output(&mut self, data: &[u8]) -> anyhow::Result<()> {
        write_frame(&mut self.writer, TYPE_BYTES, data).await
    }

    /// Report the wrapped terminal's size, e.g. on a `SIGWINCH`.
    pub async fn send_resize(&mut self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let mut body = Vec::with_capacity(5);
        body.push(CONTROL_RESIZE);
        body.put_u16_le(cols);
        body.put_u16_le(rows);
        write_frame(&mut self.writer, TYPE_CONTROL, &body).await
    }

    pub async fn send_title(&mut self, title: &str) -> anyhow::Result<()> {
        let mut body = Vec::with_capacity(1 + title.len());
        body.push(CONTROL_TITLE_SET);
        body.extend_from_slice(title.as_bytes());
        write_frame(&mut self.writer, TYPE_CONTROL, &body).await
    }

    pub async fn send_status(&mut self, code: Option<i32>) -> anyhow::Result<()> {
        let mut body = Vec::with_capacity(5);
        match code {
            Some(c) => {
                body.push(1);
                body.put_i32_le(c);
            }
            None => body.push(0),
        }
        write_frame(&mut self.writer, TYPE_STATUS, &body).await
    }

    /// Wait for the next frame the engine sends down (input to deliver, or
    /// a resize it wants applied). Returns `None` on a clean disconnect.
    pub async fn recv(&mut self) -> anyhow::Result<Option<EngineFrame>> {
        loop {
            return Ok(match read_frame(&mut self.reader, &mut self.recv_buf).await? {
                None => None,
                Some(IngestFrame::Bytes(data)) => Some(EngineFrame::Stdin(data)),
                Some(IngestFrame::Resize { cols, rows }) => Some(EngineFrame::Resize { cols, rows }),
                // Title-set and status frames are wrapper→engine only; the
                // engine never sends them back down.
                Some(IngestFrame::TitleSet(_)) | Some(IngestFrame::Status { .. }) => continue,
            });
        }
    }
}

#[cfg(test)]
#[path = "external_ingest_tests.rs"]
mod tests;
