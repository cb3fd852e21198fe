// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `vt-forward`: the §6 CLI wrapper. Spawns a local program on its own PTY,
//! mirrors that PTY's I/O to the real controlling terminal, and duplicates
//! it into an already-registered external session's `ipc.sock`, so a
//! remote client sees the same bytes a user sitting at this terminal does.

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use nix::sys::termios;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use vt_engine::external_ingest::{socket_path, EngineFrame, IngestClient};
use vt_engine::pty::spawn::NativePty;
use vt_engine::pty::{Backend, BackendInput};

#[derive(Debug, Parser)]
#[command(name = "vt-forward", version, about = "Forward a local program's terminal into an external session")]
struct Args {
    /// Id of a session already registered with `external: true`.
    #[arg(long)]
    session_id: String,

    /// Root directory holding per-session state, matching the engine's `--control-dir`.
    #[arg(long, env = "CONTROL_DIR")]
    control_dir: PathBuf,

    /// Push the wrapped program's window title to the engine as it starts.
    #[arg(long)]
    update_title: bool,

    /// Program (and arguments) to run locally.
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

/// RAII guard restoring the terminal's original termios on drop.
struct RawModeGuard {
    fd: i32,
    original: termios::Termios,
}

impl RawModeGuard {
    fn enter() -> anyhow::Result<Self> {
        let fd = std::io::stdin().as_raw_fd();
        let borrowed = borrow_fd(fd);
        let original = termios::tcgetattr(borrowed)?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(borrowed, termios::SetArg::TCSAFLUSH, &raw)?;
        Ok(Self { fd, original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let borrowed = borrow_fd(self.fd);
        let _ = termios::tcsetattr(borrowed, termios::SetArg::TCSAFLUSH, &self.original);
    }
}

fn borrow_fd(fd: i32) -> std::os::fd::BorrowedFd<'static> {
    // SAFETY: stdin fd 0 is valid for the lifetime of the process.
    #[allow(unsafe_code)]
    unsafe {
        std::os::fd::BorrowedFd::borrow_raw(fd)
    }
}

fn terminal_size() -> Option<(u16, u16)> {
    let fd = std::io::stdout().as_raw_fd();
    let mut ws = nix::libc::winsize { ws_row: 0, ws_col: 0, ws_xpixel: 0, ws_ypixel: 0 };
    // SAFETY: TIOCGWINSZ reads terminal size into a properly-initialized winsize.
    #[allow(unsafe_code)]
    let ret = unsafe { nix::libc::ioctl(fd, nix::libc::TIOCGWINSZ, &mut ws) };
    if ret == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
        Some((ws.ws_col, ws.ws_row))
    } else {
        None
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let socket = socket_path(&args.control_dir.join(&args.session_id));
    let mut ingest = match IngestClient::connect(&socket).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("vt-forward: failed to connect to {}: {e:#}", socket.display());
            return 1;
        }
    };

    let (cols, rows) = terminal_size().unwrap_or((80, 24));

    let mut backend = match NativePty::spawn(&args.command, cols, rows, "xterm-256color", None, &[]) {
        Ok(pty) => pty,
        Err(e) => {
            eprintln!("vt-forward: failed to spawn {:?}: {e:#}", args.command);
            return 1;
        }
    };

    let raw_guard = match RawModeGuard::enter() {
        Ok(g) => g,
        Err(e) => {
            eprintln!("vt-forward: failed to enter raw mode: {e}");
            return 1;
        }
    };

    // Restore the terminal even if we unwind via panic.
    let restored = Arc::new(AtomicBool::new(false));
    {
        let restored = Arc::clone(&restored);
        let raw_termios: nix::libc::termios = raw_guard.original.clone().into();
        let fd = raw_guard.fd;
        let prev_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if !restored.swap(true, Ordering::SeqCst) {
                // SAFETY: restoring termios in a panic hook on the same fd entered above.
                #[allow(unsafe_code)]
                unsafe {
                    nix::libc::tcsetattr(fd, nix::libc::TCSAFLUSH, &raw_termios);
                }
            }
            prev_hook(info);
        }));
    }

    if args.update_title {
        let title = args.command.join(" ");
        let _ = ingest.send_title(&title).await;
    }
    let _ = ingest.send_resize(cols, rows).await;

    let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(256);
    let (input_tx, input_rx) = mpsc::channel::<BackendInput>(256);
    let pty_run = tokio::spawn(async move { backend.run(output_tx, input_rx).await });

    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        use std::io::Read;
        let stdin = std::io::stdin();
        let mut handle = stdin.lock();
        let mut buf = [0u8; 4096];
        loop {
            match handle.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut sigwinch = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()).ok();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            // PTY output: show it locally and relay it upstream.
            data = output_rx.recv() => {
                match data {
                    Some(bytes) => {
                        let _ = stdout.write_all(&bytes).await;
                        let _ = stdout.flush().await;
                        if ingest.send_output(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Local keystrokes: feed the wrapped program directly.
            data = stdin_rx.recv() => {
                match data {
                    Some(bytes) => {
                        if input_tx.send(BackendInput::Write(Bytes::from(bytes))).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Remote input/resize relayed down from the engine.
            frame = ingest.recv() => {
                match frame {
                    Ok(Some(EngineFrame::Stdin(data))) => {
                        if input_tx.send(BackendInput::Write(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(EngineFrame::Resize { .. })) => {
                        // The wrapper's own controlling terminal is authoritative.
                    }
                    Ok(None) | Err(_) => break,
                }
            }

            // Local terminal resize: apply to the wrapped PTY and report upstream.
            _ = async {
                match sigwinch.as_mut() {
                    Some(s) => { s.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Some((cols, rows)) = terminal_size() {
                    let _ = input_tx.send(BackendInput::Resize { cols, rows }).await;
                    let _ = ingest.send_resize(cols, rows).await;
                }
            }
        }
    }

    drop(input_tx);
    let exit_code = pty_run.await.ok().and_then(Result::ok).and_then(|e| e.code);
    let _ = ingest.send_status(exit_code).await;

    drop(raw_guard);
    eprintln!("\r\nvt-forward: wrapped program exited.");
    exit_code.unwrap_or(0)
}
