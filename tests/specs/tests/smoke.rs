// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `vt-engine` binary and
//! exercise its HTTP control surface and binary v3 WebSocket protocol.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use vt_engine_specs::{subscribe_payload, subscribe_payload_with_offset, EngineProcess};

const TIMEOUT: Duration = Duration::from_secs(10);

// -- HTTP control surface ------------------------------------------------------

#[tokio::test]
async fn http_health() -> anyhow::Result<()> {
    let engine = EngineProcess::start()?;
    engine.wait_healthy(TIMEOUT).await?;

    let resp = reqwest::get(format!("{}/api/health", engine.base_url())).await?;
    assert!(resp.status().is_success());

    Ok(())
}

#[tokio::test]
async fn http_session_lifecycle() -> anyhow::Result<()> {
    let engine = EngineProcess::start()?;
    engine.wait_healthy(TIMEOUT).await?;
    let client = reqwest::Client::new();

    let id = engine.create_session(&["cat"]).await?;

    let list: serde_json::Value = client.get(format!("{}/api/sessions", engine.base_url())).send().await?.json().await?;
    assert!(list.as_array().unwrap().iter().any(|s| s["id"] == id));

    client
        .post(format!("{}/api/sessions/{id}/input", engine.base_url()))
        .json(&serde_json::json!({ "data": base64_encode(b"hello\n") }))
        .send()
        .await?
        .error_for_status()?;

    client
        .post(format!("{}/api/sessions/{id}/resize", engine.base_url()))
        .json(&serde_json::json!({ "cols": 120, "rows": 40 }))
        .send()
        .await?
        .error_for_status()?;

    let snapshot = client.get(format!("{}/api/sessions/{id}/snapshot", engine.base_url())).send().await?;
    assert!(snapshot.status().is_success());
    let body = snapshot.bytes().await?;
    assert!(body.len() >= 2, "snapshot body too small to hold a magic prefix");
    let magic = u16::from_le_bytes([body[0], body[1]]);
    assert_eq!(magic, vt_engine::frame::MAGIC);

    client.delete(format!("{}/api/sessions/{id}", engine.base_url())).send().await?.error_for_status()?;

    Ok(())
}

#[tokio::test]
async fn http_create_session_rejects_empty_command() -> anyhow::Result<()> {
    let engine = EngineProcess::start()?;
    engine.wait_healthy(TIMEOUT).await?;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/sessions", engine.base_url()))
        .json(&serde_json::json!({ "command": [] }))
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 400);

    Ok(())
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

// -- WebSocket (binary v3 frame protocol) --------------------------------------

#[tokio::test]
async fn ws_subscribe_receives_a_snapshot_then_live_stdout() -> anyhow::Result<()> {
    let engine = EngineProcess::start()?;
    engine.wait_healthy(TIMEOUT).await?;
    let id = engine.create_session(&["cat"]).await?;

    let (mut ws, _) = tokio_tungstenite::connect_async(engine.ws_url()).await?;

    // WELCOME greets every new connection before anything is requested.
    let welcome = next_frame(&mut ws).await?;
    assert_eq!(welcome.0, vt_engine::frame::FrameType::Welcome as u8);
    assert!(welcome.1.is_empty(), "WELCOME is a connection-global frame with no session id");

    let subscribe = vt_engine::frame::encode(
        vt_engine::frame::FrameType::Subscribe,
        &id,
        &subscribe_payload(0, 0, 5000),
    );
    ws.send(Message::Binary(subscribe)).await?;

    // SUBSCRIBE immediately triggers a snapshot for the new subscriber.
    let mut saw_snapshot = false;
    for _ in 0..4 {
        let (frame_type, session_id, _payload) = next_frame(&mut ws).await?;
        if frame_type == 5 && session_id == id {
            saw_snapshot = true;
            break;
        }
    }
    assert!(saw_snapshot, "expected a SNAPSHOT_VT frame for the subscribed session");

    let input = vt_engine::frame::encode(vt_engine::frame::FrameType::Input, &id, b"echo-me\n");
    ws.send(Message::Binary(input)).await?;

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("never observed echoed stdout over the websocket");
        }
        let (frame_type, session_id, payload) = next_frame(&mut ws).await?;
        if frame_type == 4 && session_id == id && payload.windows(7).any(|w| w == b"echo-me") {
            break;
        }
    }

    Ok(())
}

#[tokio::test]
async fn ws_rejects_an_incompatible_subprotocol() -> anyhow::Result<()> {
    let engine = EngineProcess::start()?;
    engine.wait_healthy(TIMEOUT).await?;

    let mut request = engine.ws_url().into_client_request()?;
    request.headers_mut().insert("sec-websocket-protocol", "some.other.protocol".parse()?);
    let result = tokio_tungstenite::connect_async(request).await;
    assert!(result.is_err(), "an offered subprotocol that excludes vibetunnel.v3 must be refused");

    Ok(())
}

#[tokio::test]
async fn reattach_after_clear_replays_only_bytes_after_the_clear() -> anyhow::Result<()> {
    let engine = EngineProcess::start()?;
    engine.wait_healthy(TIMEOUT).await?;
    let id = engine
        .create_session(&["sh", "-c", "printf 'before-clear'; printf '\\033[2J'; printf 'after-clear'; sleep 5"])
        .await?;

    // Let the command finish writing before the first subscriber ever
    // attaches, so the clear has already been scanned and anchored.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(engine.ws_url()).await?;
    next_frame(&mut ws).await?; // WELCOME

    let subscribe =
        vt_engine::frame::encode(vt_engine::frame::FrameType::Subscribe, &id, &subscribe_payload(0b001, 0, 0));
    ws.send(Message::Binary(subscribe)).await?;

    let mut replayed = Vec::new();
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if tokio::time::Instant::now() > deadline {
            break;
        }
        let (frame_type, session_id, payload) = match tokio::time::timeout(Duration::from_millis(500), next_frame(&mut ws)).await {
            Ok(result) => result?,
            Err(_) => break, // no further frames arriving; the replay burst has ended
        };
        if frame_type == 4 && session_id == id {
            replayed.extend_from_slice(&payload);
        }
    }

    let replayed_text = String::from_utf8_lossy(&replayed);
    assert!(
        !replayed_text.contains("before-clear"),
        "reattach must not replay bytes written before the clear, got: {replayed_text:?}"
    );
    assert!(
        replayed_text.contains("after-clear"),
        "reattach must still replay bytes written after the clear, got: {replayed_text:?}"
    );

    Ok(())
}

#[tokio::test]
async fn reattach_with_an_offset_skips_bytes_already_seen() -> anyhow::Result<()> {
    let engine = EngineProcess::start()?;
    engine.wait_healthy(TIMEOUT).await?;
    let id = engine.create_session(&["sh", "-c", "printf 'first-chunk-second-chunk'; sleep 5"]).await?;

    tokio::time::sleep(Duration::from_millis(500)).await;

    // A client that already consumed "first-chunk" (11 bytes) and reattaches
    // from that offset should not see it replayed again.
    let (mut ws, _) = tokio_tungstenite::connect_async(engine.ws_url()).await?;
    next_frame(&mut ws).await?; // WELCOME

    let subscribe = vt_engine::frame::encode(
        vt_engine::frame::FrameType::Subscribe,
        &id,
        &subscribe_payload_with_offset(0b001, 0, 0, "first-chunk".len() as u64),
    );
    ws.send(Message::Binary(subscribe)).await?;

    let mut replayed = Vec::new();
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if tokio::time::Instant::now() > deadline {
            break;
        }
        let (frame_type, session_id, payload) = match tokio::time::timeout(Duration::from_millis(500), next_frame(&mut ws)).await {
            Ok(result) => result?,
            Err(_) => break,
        };
        if frame_type == 4 && session_id == id {
            replayed.extend_from_slice(&payload);
        }
    }

    let replayed_text = String::from_utf8_lossy(&replayed);
    assert!(
        !replayed_text.contains("first-chunk"),
        "reattach from an offset must not replay bytes already seen, got: {replayed_text:?}"
    );
    assert!(
        replayed_text.contains("second-chunk"),
        "reattach from an offset must still replay bytes written after it, got: {replayed_text:?}"
    );

    Ok(())
}

#[tokio::test]
async fn slow_subscriber_receives_slow_consumer_error() -> anyhow::Result<()> {
    let engine = EngineProcess::start()?;
    engine.wait_healthy(TIMEOUT).await?;
    // `yes` floods stdout far faster than a stalled client can ever drain it.
    let id = engine.create_session(&["yes"]).await?;

    // A fast subscriber kept draining throughout, so the session's own
    // reader never stalls on account of the slow one below.
    let (mut fast_ws, _) = tokio_tungstenite::connect_async(engine.ws_url()).await?;
    next_frame(&mut fast_ws).await?; // WELCOME
    let subscribe =
        vt_engine::frame::encode(vt_engine::frame::FrameType::Subscribe, &id, &subscribe_payload(0b001, 0, 0));
    fast_ws.send(Message::Binary(subscribe.clone())).await?;
    let fast_drain = tokio::spawn(async move {
        loop {
            if next_frame(&mut fast_ws).await.is_err() {
                break;
            }
        }
    });

    // The slow subscriber: subscribes, then its socket is never read again,
    // standing in for a client that stopped draining its connection.
    let (mut slow_ws, _) = tokio_tungstenite::connect_async(engine.ws_url()).await?;
    next_frame(&mut slow_ws).await?; // WELCOME
    slow_ws.send(Message::Binary(subscribe)).await?;

    // Give the flood time to back the slow subscriber's outbox up past its
    // hard cap, then read whatever the server queued for it.
    tokio::time::sleep(Duration::from_secs(5)).await;

    let mut saw_slow_consumer_error = false;
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        let (frame_type, _session_id, payload) =
            match tokio::time::timeout(Duration::from_secs(2), next_frame(&mut slow_ws)).await {
                Ok(Ok(frame)) => frame,
                _ => break,
            };
        if frame_type == vt_engine::frame::FrameType::Error as u8 && payload.len() >= 2 {
            let http_status = u16::from_le_bytes([payload[0], payload[1]]);
            if http_status == vt_engine::error::ErrorCode::SlowConsumer.http_status() {
                saw_slow_consumer_error = true;
                break;
            }
        }
    }

    fast_drain.abort();
    assert!(saw_slow_consumer_error, "expected the stalled subscriber to receive ERROR{{SLOW_CONSUMER}}");

    Ok(())
}

// -- Auth -----------------------------------------------------------------------

#[tokio::test]
async fn token_mode_rejects_unauthenticated_http() -> anyhow::Result<()> {
    let engine = EngineProcess::build().token("secret-token").spawn()?;
    engine.wait_healthy(TIMEOUT).await?;

    let client = reqwest::Client::new();
    let resp = client.get(format!("{}/api/sessions", engine.base_url())).send().await?;
    assert_eq!(resp.status().as_u16(), 401);

    let resp = client
        .get(format!("{}/api/sessions", engine.base_url()))
        .bearer_auth("secret-token")
        .send()
        .await?;
    assert!(resp.status().is_success());

    Ok(())
}

// -- Health port ------------------------------------------------------------------

#[tokio::test]
async fn health_port_is_independent_of_the_main_listener() -> anyhow::Result<()> {
    let engine = EngineProcess::build().health().spawn()?;
    engine.wait_healthy(TIMEOUT).await?;

    let health_url = engine.health_url().expect("health port was requested");
    let resp = reqwest::get(format!("{health_url}/api/health")).await?;
    assert!(resp.status().is_success());

    // The session API is not exposed on the health-only port.
    let resp = reqwest::get(format!("{health_url}/api/sessions")).await?;
    assert_eq!(resp.status().as_u16(), 404);

    Ok(())
}

async fn next_frame(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> anyhow::Result<(u8, String, Vec<u8>)> {
    let msg = tokio::time::timeout(TIMEOUT, ws.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("websocket stream ended"))??;
    let Message::Binary(data) = msg else {
        anyhow::bail!("expected a binary frame, got: {msg:?}");
    };
    let frame = vt_engine::frame::decode_one(&data).map_err(|e| anyhow::anyhow!("{e:?}"))?;
    Ok((frame.frame_type as u8, frame.session_id, frame.payload.to_vec()))
}
