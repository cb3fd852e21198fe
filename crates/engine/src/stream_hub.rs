// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session subscriber fan-out: stdout with watermark-based backpressure
//! and coalescing, a snapshot cadence scheduler, and an event bus — all
//! ordered into one per-subscriber stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::error::ErrorCode;
use crate::event::HubEvent;

/// Flags requested on SUBSCRIBE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscribeFlags {
    pub want_stdout: bool,
    pub want_snapshots: bool,
    pub want_events: bool,
}

impl SubscribeFlags {
    pub fn from_bits(bits: u32) -> Self {
        Self {
            want_stdout: bits & 0b001 != 0,
            want_snapshots: bits & 0b010 != 0,
            want_events: bits & 0b100 != 0,
        }
    }
}

/// One item in a subscriber's ordered outbox.
#[derive(Debug, Clone)]
pub enum HubMessage {
    Stdout(Bytes),
    Snapshot(Arc<crate::snapshot::VtSnapshot>),
    Event(HubEvent),
    Error(ErrorCode, String),
}

/// Outbox low/high watermarks, in queued messages. Once the high watermark
/// is hit, subsequent stdout messages are coalesced (merged) rather than
/// queued individually, until the outbox drains below the low watermark.
/// A hard cap beyond the high watermark disconnects the subscriber.
#[derive(Debug, Clone, Copy)]
pub struct Watermarks {
    pub low: usize,
    pub high: usize,
    pub hard_cap: usize,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self { low: 64, high: 256, hard_cap: 2048 }
    }
}

struct CoalescingOutbox {
    tx: mpsc::Sender<HubMessage>,
    pending_stdout: Vec<u8>,
    lagging: bool,
    len: usize,
}

/// A live subscriber: one client's WebSocket, bound to this session.
pub struct Subscriber {
    pub client_id: u64,
    pub flags: SubscribeFlags,
    pub snapshot_min_interval: Duration,
    pub snapshot_max_interval: Duration,
    outbox: Mutex<CoalescingOutbox>,
    watermarks: Watermarks,
    last_snapshot_at: Mutex<Option<tokio::time::Instant>>,
    disconnect: Arc<AtomicBool>,
}

impl Subscriber {
    /// Send a message, applying watermark/coalescing policy for stdout.
    /// Returns `Err` (and flags the subscriber for disconnect) once the
    /// hard cap is exceeded.
    async fn deliver(&self, msg: HubMessage) -> Result<(), ()> {
        let mut state = self.outbox.lock().await;

        if let HubMessage::Stdout(ref data) = msg {
            if state.lagging {
                state.pending_stdout.extend_from_slice(data);
                if state.pending_stdout.len() + state.len > self.watermarks.hard_cap {
                    self.disconnect.store(true, Ordering::SeqCst);
                    let _ = state.tx.try_send(HubMessage::Error(
                        ErrorCode::SlowConsumer,
                        "outbox exceeded hard cap".to_owned(),
                    ));
                    return Err(());
                }
                return Ok(());
            }
        }

        if state.len >= self.watermarks.high {
            if let HubMessage::Stdout(data) = msg {
                state.lagging = true;
                state.pending_stdout.extend_from_slice(&data);
                return Ok(());
            }
        }

        if state.tx.try_send(msg).is_err() {
            self.disconnect.store(true, Ordering::SeqCst);
            return Err(());
        }
        state.len += 1;
        Ok(())
    }

    /// Called by the subscriber's own send loop after it drains a message,
    /// to flush a coalesced run and clear lagging state once drained below
    /// the low watermark.
    pub async fn note_drained(&self) {
        let mut state = self.outbox.lock().await;
        if state.len > 0 {
            state.len -= 1;
        }
        if state.lagging && state.len <= self.watermarks.low {
            if !state.pending_stdout.is_empty() {
                let data = Bytes::from(std::mem::take(&mut state.pending_stdout));
                if state.tx.try_send(HubMessage::Stdout(data)).is_ok() {
                    state.len += 1;
                }
            }
            state.lagging = false;
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnect.load(Ordering::SeqCst)
    }

    /// Deliver a chunk of replayed history, subject to the same watermark
    /// and hard-cap policy as live stdout. Used once at SUBSCRIBE time to
    /// hand a reattaching subscriber the bytes it missed.
    pub async fn deliver_stdout(&self, data: Bytes) {
        let _ = self.deliver(HubMessage::Stdout(data)).await;
    }
}

/// The concurrency hub for one session: owns the subscriber set and
/// coordinates snapshot cadence and event ordering.
pub struct StreamHub {
    session_id: String,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_client_id: AtomicU64,
}

impl StreamHub {
    pub fn new(session_id: String) -> Self {
        Self { session_id, subscribers: Mutex::new(Vec::new()), next_client_id: AtomicU64::new(1) }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Register a new subscriber and return its handle plus the receiving
    /// end of its outbox, for the WebSocket send loop to drain.
    pub async fn subscribe(
        &self,
        flags: SubscribeFlags,
        snapshot_min_interval: Duration,
        snapshot_max_interval: Duration,
        watermarks: Watermarks,
    ) -> (Arc<Subscriber>, mpsc::Receiver<HubMessage>) {
        // One slot beyond the high watermark is kept permanently free: the
        // regular stdout path stops enqueuing once `len >= high` (it
        // coalesces into `pending_stdout` instead), so this slot always has
        // room for the one message that must get through regardless —
        // the hard-cap ERROR or the final exit event.
        let (tx, rx) = mpsc::channel(watermarks.high.max(16) + 1);
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            client_id,
            flags,
            snapshot_min_interval,
            snapshot_max_interval,
            outbox: Mutex::new(CoalescingOutbox {
                tx,
                pending_stdout: Vec::new(),
                lagging: false,
                len: 0,
            }),
            watermarks,
            last_snapshot_at: Mutex::new(None),
            disconnect: Arc::new(AtomicBool::new(false)),
        });
        self.subscribers.lock().await.push(subscriber.clone());
        (subscriber, rx)
    }

    pub async fn unsubscribe(&self, client_id: u64) {
        self.subscribers.lock().await.retain(|s| s.client_id != client_id);
    }

    /// Fan out stdout bytes to every subscriber that wants them. A
    /// subscriber that hits its hard cap is removed here so the session's
    /// reader loop is not itself affected.
    pub async fn publish_stdout(&self, data: Bytes) {
        let subs = self.subscribers.lock().await;
        for sub in subs.iter().filter(|s| s.flags.want_stdout) {
            let _ = sub.deliver(HubMessage::Stdout(data.clone())).await;
        }
        drop(subs);
        self.reap_disconnected().await;
    }

    /// Fan out an out-of-band event to subscribers that want them.
    pub async fn publish_event(&self, event: HubEvent) {
        let subs = self.subscribers.lock().await;
        for sub in subs.iter().filter(|s| s.flags.want_events) {
            let _ = sub.deliver(HubMessage::Event(event.clone())).await;
        }
        drop(subs);
        self.reap_disconnected().await;
    }

    /// Deliver the session's terminal exit event, then end every
    /// subscriber's stream: once a session has exited there is nothing
    /// further to publish, so each subscriber's forwarding task is closed
    /// after it drains the exit notification rather than left open
    /// waiting on a hub that will never send again.
    pub async fn publish_exit(&self, event: HubEvent) {
        let subs = self.subscribers.lock().await;
        for sub in subs.iter() {
            if sub.flags.want_events {
                let _ = sub.deliver(HubMessage::Event(event.clone())).await;
            }
            sub.disconnect.store(true, Ordering::SeqCst);
        }
        drop(subs);
        self.reap_disconnected().await;
    }

    /// Send a freshly-built snapshot to a subscriber if its cadence window
    /// permits, or unconditionally when `force` (used on reattach).
    pub async fn maybe_send_snapshot(
        &self,
        sub: &Subscriber,
        snapshot: Arc<crate::snapshot::VtSnapshot>,
        force: bool,
    ) {
        if !sub.flags.want_snapshots {
            return;
        }
        let mut last = sub.last_snapshot_at.lock().await;
        let now = tokio::time::Instant::now();
        let due = match *last {
            None => true,
            Some(t) => now.duration_since(t) >= sub.snapshot_min_interval,
        };
        if force || due {
            if sub.deliver(HubMessage::Snapshot(snapshot)).await.is_ok() {
                *last = Some(now);
            }
        }
    }

    /// Whether a subscriber's max-interval cadence has elapsed and a
    /// snapshot is overdue (session has produced output since the last one).
    pub async fn snapshot_overdue(&self, sub: &Subscriber) -> bool {
        let last = sub.last_snapshot_at.lock().await;
        match *last {
            None => true,
            Some(t) => tokio::time::Instant::now().duration_since(t) >= sub.snapshot_max_interval,
        }
    }

    async fn reap_disconnected(&self) {
        let mut subs = self.subscribers.lock().await;
        subs.retain(|s| !s.is_disconnected());
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

#[cfg(test)]
#[path = "stream_hub_tests.rs"]
mod tests;
