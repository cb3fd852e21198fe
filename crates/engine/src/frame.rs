// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Binary v3 wire frame: the single message envelope multiplexed over the
//! WebSocket connection for stdout, snapshots, input, resize, and control.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ErrorCode;

pub const MAGIC: u16 = 0x5654;
pub const VERSION: u8 = 3;

/// Hard cap on a single frame's total size (header + session id + payload).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Bytes preceding the variable-length sessionId: magic, version, type, sessionIdLen.
const PREFIX_LEN: usize = 2 + 1 + 1 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Hello,
    Welcome,
    Subscribe,
    Unsubscribe,
    Stdout,
    SnapshotVt,
    Input,
    Resize,
    Kill,
    Event,
    Ping,
    Pong,
    Error,
}

impl FrameType {
    fn to_u8(self) -> u8 {
        match self {
            Self::Hello => 0,
            Self::Welcome => 1,
            Self::Subscribe => 2,
            Self::Unsubscribe => 3,
            Self::Stdout => 4,
            Self::SnapshotVt => 5,
            Self::Input => 6,
            Self::Resize => 7,
            Self::Kill => 8,
            Self::Event => 9,
            Self::Ping => 10,
            Self::Pong => 11,
            Self::Error => 12,
        }
    }

    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Hello,
            1 => Self::Welcome,
            2 => Self::Subscribe,
            3 => Self::Unsubscribe,
            4 => Self::Stdout,
            5 => Self::SnapshotVt,
            6 => Self::Input,
            7 => Self::Resize,
            8 => Self::Kill,
            9 => Self::Event,
            10 => Self::Ping,
            11 => Self::Pong,
            12 => Self::Error,
            _ => return None,
        })
    }
}

/// A decoded frame. `session_id` is empty for connection-global frames
/// (`HELLO`/`WELCOME`/`PING`/`PONG`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub session_id: String,
    pub payload: Bytes,
}

/// Encode a single frame into its wire representation.
pub fn encode(frame_type: FrameType, session_id: &str, payload: &[u8]) -> Bytes {
    let session_bytes = session_id.as_bytes();
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + 4 + session_bytes.len() + payload.len());
    buf.put_u16_le(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(frame_type.to_u8());
    buf.put_u32_le(session_bytes.len() as u32);
    buf.put_slice(session_bytes);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Streaming decoder: feed arbitrary chunks, drain complete frames.
///
/// Buffers partial frames across calls to `push`; a single logical message
/// may arrive split across many WebSocket reads (or none at all, if the
/// transport already delivers whole messages — both are supported).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Protocol-fatal: the connection must be closed.
    BadMagicOrVersion,
    /// Protocol-fatal: the connection must be closed.
    TooLarge,
    /// Not fatal: a well-formed frame with a type this decoder doesn't
    /// recognize. The frame's bytes have already been consumed from the
    /// decoder's buffer, so decoding can continue with whatever follows.
    /// Carries the frame's session id so the caller can address the
    /// `ERROR{UNKNOWN_TYPE}` reply to it.
    UnknownType(u8, String),
}

impl DecodeError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::BadMagicOrVersion => ErrorCode::BadFrame,
            Self::TooLarge => ErrorCode::FrameTooLarge,
            Self::UnknownType(..) => ErrorCode::UnknownType,
        }
    }

    /// Whether this error means the connection must be closed. Only a
    /// malformed envelope or an oversize frame are wire-protocol
    /// violations; an unrecognized type is answered inline and ignored.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::UnknownType(..))
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly-received bytes into the decoder.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempt to decode the next complete frame from the buffer.
    ///
    /// Returns `Ok(None)` if more bytes are needed. On `Err`, the connection
    /// must be terminated — the buffer is left in an indeterminate state.
    pub fn try_decode(&mut self) -> Result<Option<Frame>, DecodeError> {
        if self.buf.len() < PREFIX_LEN {
            return Ok(None);
        }

        let mut peek = &self.buf[..];
        let magic = peek.get_u16_le();
        let version = peek.get_u8();
        let type_byte = peek.get_u8();
        let session_id_len = peek.get_u32_le() as usize;

        if magic != MAGIC || version != VERSION {
            return Err(DecodeError::BadMagicOrVersion);
        }

        if PREFIX_LEN + session_id_len + 4 > MAX_FRAME_SIZE {
            return Err(DecodeError::TooLarge);
        }
        if self.buf.len() < PREFIX_LEN + session_id_len + 4 {
            return Ok(None);
        }

        let payload_len = {
            let mut p = &self.buf[PREFIX_LEN + session_id_len..];
            p.get_u32_le() as usize
        };

        let total_len = PREFIX_LEN + session_id_len + 4 + payload_len;
        if total_len > MAX_FRAME_SIZE {
            return Err(DecodeError::TooLarge);
        }
        if self.buf.len() < total_len {
            return Ok(None);
        }

        // The frame is fully buffered: consume it now regardless of whether
        // its type is recognized, so an unknown type doesn't get re-decoded
        // forever.
        let mut frame_bytes = self.buf.split_to(total_len);
        frame_bytes.advance(PREFIX_LEN);
        let session_id_bytes = frame_bytes.split_to(session_id_len);
        let session_id = String::from_utf8_lossy(&session_id_bytes).into_owned();
        frame_bytes.advance(4); // payloadLen, already consumed above
        let payload = frame_bytes.freeze();

        let Some(frame_type) = FrameType::from_u8(type_byte) else {
            return Err(DecodeError::UnknownType(type_byte, session_id));
        };

        Ok(Some(Frame { frame_type, session_id, payload }))
    }
}

/// Decode a single, already-complete frame (e.g. one WebSocket binary message).
pub fn decode_one(data: &[u8]) -> Result<Frame, DecodeError> {
    let mut decoder = FrameDecoder::new();
    decoder.push(data);
    decoder.try_decode()?.ok_or(DecodeError::BadMagicOrVersion)
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
