// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single WebSocket endpoint multiplexing every session's binary frame
//! stream, per the `vibetunnel.v3` subprotocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::{Buf, Bytes};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::auth;
use crate::error::ErrorCode;
use crate::event::PtySignal;
use crate::frame::{self, Frame, FrameType};
use crate::run::AppState;
use crate::stream_hub::{HubMessage, SubscribeFlags};

const SUBPROTOCOL: &str = "vibetunnel.v3";
const PING_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MISSED_PONGS: u32 = 2;
/// Bound on the per-connection outbound queue; a connection that can't
/// drain this fast is slower than any single session's backpressure path.
const OUTBOUND_CAPACITY: usize = 1024;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(offered) = headers.get("sec-websocket-protocol").and_then(|v| v.to_str().ok()) {
        if !offered.split(',').any(|p| p.trim() == SUBPROTOCOL) {
            return (StatusCode::BAD_REQUEST, "missing vibetunnel.v3 subprotocol").into_response();
        }
    }

    if auth::validate_ws_token(
        state.config.auth_mode,
        query.token.as_deref(),
        state.config.local_bypass_token.as_deref(),
    )
    .is_err()
    {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    ws.protocols([SUBPROTOCOL]).on_upgrade(move |socket| handle_connection(state, socket))
}

/// Forwarding task spawned per SUBSCRIBE: drains a subscriber's outbox and
/// re-encodes each message as a wire frame onto the connection's outbound
/// channel.
fn spawn_forwarder(
    session_id: String,
    mut rx: mpsc::Receiver<HubMessage>,
    subscriber: Arc<crate::stream_hub::Subscriber>,
    outbound_tx: mpsc::Sender<Bytes>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match &msg {
                HubMessage::Stdout(data) => frame::encode(FrameType::Stdout, &session_id, data),
                HubMessage::Snapshot(snap) => {
                    frame::encode(FrameType::SnapshotVt, &session_id, &crate::snapshot::encode(snap))
                }
                HubMessage::Event(event) => {
                    frame::encode(FrameType::Event, &session_id, &encode_event(event))
                }
                HubMessage::Error(code, message) => {
                    frame::encode(FrameType::Error, &session_id, &encode_error(*code, message))
                }
            };
            subscriber.note_drained().await;
            if outbound_tx.send(frame).await.is_err() {
                break;
            }
            if subscriber.is_disconnected() {
                break;
            }
        }
    })
}

fn encode_event(event: &crate::event::HubEvent) -> Vec<u8> {
    serde_json::to_vec(event).unwrap_or_default()
}

fn encode_error(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + message.len());
    buf.extend_from_slice(&code.http_status().to_le_bytes());
    buf.extend_from_slice(message.as_bytes());
    buf
}

struct Subscription {
    subscriber: Arc<crate::stream_hub::Subscriber>,
    forwarder: JoinHandle<()>,
}

async fn handle_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
    let mut decoder = frame::FrameDecoder::new();
    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();
    let mut missed_pongs: u32 = 0;
    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.tick().await; // first tick fires immediately; discard it.

    let welcome = frame::encode(FrameType::Welcome, "", b"{\"version\":3}");
    if ws_tx.send(Message::Binary(welcome)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            biased;

            _ = ping_timer.tick() => {
                if missed_pongs >= MAX_MISSED_PONGS {
                    debug!("closing idle websocket connection after missed pongs");
                    break;
                }
                missed_pongs += 1;
                let ping = frame::encode(FrameType::Ping, "", &[]);
                if ws_tx.send(Message::Binary(ping)).await.is_err() {
                    break;
                }
            }

            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(bytes) => {
                        if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            incoming = ws_rx.next() => {
                let Some(incoming) = incoming else { break };
                let Ok(incoming) = incoming else { break };
                match incoming {
                    Message::Binary(data) => {
                        decoder.push(&data);
                        loop {
                            match decoder.try_decode() {
                                Ok(Some(frame)) => {
                                    if !dispatch(
                                        &state,
                                        frame,
                                        &outbound_tx,
                                        &mut subscriptions,
                                        &mut missed_pongs,
                                    ).await {
                                        for sub in subscriptions.values() {
                                            sub.forwarder.abort();
                                        }
                                        return;
                                    }
                                }
                                Ok(None) => break,
                                Err(frame::DecodeError::UnknownType(_, session_id)) => {
                                    let err = frame::encode(
                                        FrameType::Error,
                                        &session_id,
                                        &encode_error(ErrorCode::UnknownType, "unknown frame type"),
                                    );
                                    if ws_tx.send(Message::Binary(err)).await.is_err() {
                                        break;
                                    }
                                    continue;
                                }
                                Err(e) => {
                                    let err = frame::encode(
                                        FrameType::Error,
                                        "",
                                        &encode_error(e.error_code(), "malformed frame"),
                                    );
                                    let _ = ws_tx.send(Message::Binary(err)).await;
                                    for sub in subscriptions.values() {
                                        sub.forwarder.abort();
                                    }
                                    return;
                                }
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    for (session_id, sub) in subscriptions.drain() {
        sub.forwarder.abort();
        if let Some(session) = state.store.get(&session_id).await {
            session.hub().unsubscribe(sub.subscriber.client_id).await;
        }
    }
}

/// Handle one decoded frame. Returns `false` if the connection must be
/// closed (protocol-level fault); per-request errors are reported inline
/// via an `ERROR` frame without closing.
async fn dispatch(
    state: &Arc<AppState>,
    frame: Frame,
    outbound_tx: &mpsc::Sender<Bytes>,
    subscriptions: &mut HashMap<String, Subscription>,
    missed_pongs: &mut u32,
) -> bool {
    match frame.frame_type {
        FrameType::Hello => {
            let welcome = frame::encode(FrameType::Welcome, "", b"{\"version\":3}");
            let _ = outbound_tx.send(welcome).await;
        }
        FrameType::Pong => {
            *missed_pongs = 0;
        }
        FrameType::Ping => {
            let pong = frame::encode(FrameType::Pong, "", &[]);
            let _ = outbound_tx.send(pong).await;
        }
        FrameType::Subscribe => {
            handle_subscribe(state, &frame, outbound_tx, subscriptions).await;
        }
        FrameType::Unsubscribe => {
            if let Some(sub) = subscriptions.remove(&frame.session_id) {
                sub.forwarder.abort();
                if let Some(session) = state.store.get(&frame.session_id).await {
                    session.hub().unsubscribe(sub.subscriber.client_id).await;
                }
            }
        }
        FrameType::Input => {
            if let Err(code) = handle_input(state, &frame).await {
                send_error(outbound_tx, &frame.session_id, code).await;
            }
        }
        FrameType::Resize => {
            if let Err(code) = handle_resize(state, &frame).await {
                send_error(outbound_tx, &frame.session_id, code).await;
            }
        }
        FrameType::Kill => {
            if let Err(code) = handle_kill(state, &frame).await {
                send_error(outbound_tx, &frame.session_id, code).await;
            }
        }
        FrameType::Welcome | FrameType::Stdout | FrameType::SnapshotVt | FrameType::Event | FrameType::Error => {
            // Server→client-only frame types received from a client: ignore.
        }
    }
    true
}

async fn handle_subscribe(
    state: &Arc<AppState>,
    frame: &Frame,
    outbound_tx: &mpsc::Sender<Bytes>,
    subscriptions: &mut HashMap<String, Subscription>,
) {
    let Some(session) = state.store.get(&frame.session_id).await else {
        send_error(outbound_tx, &frame.session_id, ErrorCode::SessionNotFound).await;
        return;
    };

    let mut payload = &frame.payload[..];
    if payload.len() < 12 {
        send_error(outbound_tx, &frame.session_id, ErrorCode::BadRequest).await;
        return;
    }
    let flags = SubscribeFlags::from_bits(payload.get_u32_le());
    let min_ms = payload.get_u32_le();
    let max_ms = payload.get_u32_le();
    // Trailing field, added for reattach: the client's last-known stream
    // offset. Older 12-byte payloads (no offset) are treated as a fresh
    // subscribe, which CastLog::reattach_offset still anchors to the last
    // clear so a first-time subscriber never sees pre-clear bytes.
    let from_offset = if payload.len() >= 8 { payload.get_u64_le() } else { 0 };

    let (subscriber, rx) = session
        .hub()
        .subscribe(
            flags,
            Duration::from_millis(min_ms as u64),
            Duration::from_millis(max_ms as u64),
            state.config.watermarks(),
        )
        .await;

    let forwarder =
        spawn_forwarder(frame.session_id.clone(), rx, subscriber.clone(), outbound_tx.clone());
    subscriptions.insert(frame.session_id.clone(), Subscription { subscriber: subscriber.clone(), forwarder });

    // Reattach order per the stream hub's contract: a synthetic snapshot
    // first, then the replayed bytes the subscriber missed, then live tail
    // (already flowing through the subscription registered above).
    let snapshot = Arc::new(session.snapshot(0).await);
    session.hub().maybe_send_snapshot(&subscriber, snapshot, true).await;

    if flags.want_stdout {
        let mut replay_stream = session.cast_log().tail_stream(from_offset);
        if let Some(replay) = replay_stream.next().await {
            if !replay.is_empty() {
                subscriber.deliver_stdout(replay).await;
            }
        }
    }
}

async fn handle_input(state: &Arc<AppState>, frame: &Frame) -> Result<(), ErrorCode> {
    let session = state.store.get(&frame.session_id).await.ok_or(ErrorCode::SessionNotFound)?;
    session.send_input(frame.payload.clone())
}

async fn handle_resize(state: &Arc<AppState>, frame: &Frame) -> Result<(), ErrorCode> {
    let session = state.store.get(&frame.session_id).await.ok_or(ErrorCode::SessionNotFound)?;
    let mut payload = &frame.payload[..];
    if payload.len() < 8 {
        return Err(ErrorCode::BadRequest);
    }
    let cols = payload.get_u32_le();
    let rows = payload.get_u32_le();
    session.resize(cols as u16, rows as u16).await
}

async fn handle_kill(state: &Arc<AppState>, frame: &Frame) -> Result<(), ErrorCode> {
    let session = state.store.get(&frame.session_id).await.ok_or(ErrorCode::SessionNotFound)?;
    let name = std::str::from_utf8(&frame.payload).map_err(|_| ErrorCode::BadRequest)?;
    let signal = PtySignal::from_name(name).ok_or(ErrorCode::BadRequest)?;
    session.signal(signal)
}

async fn send_error(outbound_tx: &mpsc::Sender<Bytes>, session_id: &str, code: ErrorCode) {
    let frame = frame::encode(FrameType::Error, session_id, &encode_error(code, code.as_str()));
    let _ = outbound_tx.send(frame).await;
}

#[cfg(test)]
#[path = "ws_router_tests.rs"]
mod tests;
