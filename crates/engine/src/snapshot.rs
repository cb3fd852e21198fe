// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Binary encode/decode for the `SNAPSHOT_VT` payload: a self-describing
//! cell-grid capture of a terminal at a point in time.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::frame::MAGIC;

const SNAPSHOT_VERSION: u8 = 1;
/// High bit on a cell's codepoint field marks a run-length-compressed blank run.
const RUN_FLAG: u32 = 0x8000_0000;
/// Minimum run length worth spending the extra u32 on.
const MIN_RUN_LEN: usize = 4;

pub const ATTR_CURSOR_VISIBLE: u8 = 1 << 0;
pub const ATTR_ALT_SCREEN: u8 = 1 << 1;
pub const ATTR_WRAP: u8 = 1 << 2;

/// One terminal cell: a codepoint plus foreground/background colors with
/// attribute bits packed into the alpha channel (bold/italic/underline/inverse).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotCell {
    pub codepoint: u32,
    pub fg_rgba: u32,
    pub bg_rgba: u32,
}

impl SnapshotCell {
    pub const BLANK: SnapshotCell = SnapshotCell { codepoint: 0, fg_rgba: 0, bg_rgba: 0 };

    pub fn is_blank(&self) -> bool {
        *self == Self::BLANK
    }
}

/// Attribute bit flags packed into a cell's fg_rgba alpha byte.
pub mod cell_attr {
    pub const BOLD: u32 = 1 << 24;
    pub const ITALIC: u32 = 1 << 25;
    pub const UNDERLINE: u32 = 1 << 26;
    pub const INVERSE: u32 = 1 << 27;
}

#[derive(Debug, Clone, PartialEq)]
pub struct VtSnapshot {
    pub cols: u32,
    pub rows: u32,
    pub cursor_row: u32,
    pub cursor_col: u32,
    pub attr_flags: u8,
    /// Row-major, `cols * rows` entries.
    pub cells: Vec<SnapshotCell>,
    /// Scrollback lines, oldest first; each is a row of cells (length may
    /// vary per line, unlike the fixed `cols` of the live grid).
    pub scrollback: Vec<Vec<SnapshotCell>>,
}

pub fn encode(snapshot: &VtSnapshot) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16_le(MAGIC);
    buf.put_u8(SNAPSHOT_VERSION);
    buf.put_u32_le(snapshot.cols);
    buf.put_u32_le(snapshot.rows);
    buf.put_u32_le(snapshot.cursor_row);
    buf.put_u32_le(snapshot.cursor_col);
    buf.put_u8(snapshot.attr_flags);
    encode_cells(&mut buf, &snapshot.cells);
    buf.put_u16_le(snapshot.scrollback.len() as u16);
    for line in &snapshot.scrollback {
        encode_cells(&mut buf, line);
    }
    buf.freeze()
}

fn encode_cells(buf: &mut BytesMut, cells: &[SnapshotCell]) {
    // First pass: build run-length-compressed entries.
    let mut entries: Vec<(u32, Option<(u32, u32)>)> = Vec::new();
    let mut i = 0;
    while i < cells.len() {
        if cells[i].is_blank() {
            let mut run = 1;
            while i + run < cells.len() && cells[i + run].is_blank() {
                run += 1;
            }
            if run >= MIN_RUN_LEN {
                entries.push((RUN_FLAG | run as u32, None));
                i += run;
                continue;
            }
        }
        entries.push((cells[i].codepoint, Some((cells[i].fg_rgba, cells[i].bg_rgba))));
        i += 1;
    }

    buf.put_u32_le(cells.len() as u32);
    for (codepoint, colors) in entries {
        buf.put_u32_le(codepoint);
        if let Some((fg, bg)) = colors {
            buf.put_u32_le(fg);
            buf.put_u32_le(bg);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SnapshotDecodeError {
    BadMagicOrVersion,
    Truncated,
    SizeMismatch,
}

pub fn decode(data: &[u8]) -> Result<VtSnapshot, SnapshotDecodeError> {
    let mut buf = data;
    if buf.len() < 2 + 1 + 4 * 4 + 1 {
        return Err(SnapshotDecodeError::Truncated);
    }
    let magic = buf.get_u16_le();
    let version = buf.get_u8();
    if magic != MAGIC || version != SNAPSHOT_VERSION {
        return Err(SnapshotDecodeError::BadMagicOrVersion);
    }
    let cols = buf.get_u32_le();
    let rows = buf.get_u32_le();
    let cursor_row = buf.get_u32_le();
    let cursor_col = buf.get_u32_le();
    let attr_flags = buf.get_u8();

    let cells = decode_cells(&mut buf)?;
    if cells.len() as u64 != cols as u64 * rows as u64 {
        return Err(SnapshotDecodeError::SizeMismatch);
    }

    if buf.len() < 2 {
        return Err(SnapshotDecodeError::Truncated);
    }
    let scrollback_lines = buf.get_u16_le();
    let mut scrollback = Vec::with_capacity(scrollback_lines as usize);
    for _ in 0..scrollback_lines {
        scrollback.push(decode_cells(&mut buf)?);
    }

    Ok(VtSnapshot { cols, rows, cursor_row, cursor_col, attr_flags, cells, scrollback })
}

fn decode_cells(buf: &mut &[u8]) -> Result<Vec<SnapshotCell>, SnapshotDecodeError> {
    if buf.len() < 4 {
        return Err(SnapshotDecodeError::Truncated);
    }
    let declared_len = buf.get_u32_le() as usize;
    let mut cells = Vec::with_capacity(declared_len.min(1 << 20));

    while cells.len() < declared_len {
        if buf.len() < 4 {
            return Err(SnapshotDecodeError::Truncated);
        }
        let codepoint = buf.get_u32_le();
        if codepoint & RUN_FLAG != 0 {
            let run = (codepoint & !RUN_FLAG) as usize;
            if cells.len() + run > declared_len {
                return Err(SnapshotDecodeError::SizeMismatch);
            }
            cells.extend(std::iter::repeat(SnapshotCell::BLANK).take(run));
        } else {
            if buf.len() < 8 {
                return Err(SnapshotDecodeError::Truncated);
            }
            let fg_rgba = buf.get_u32_le();
            let bg_rgba = buf.get_u32_le();
            cells.push(SnapshotCell { codepoint, fg_rgba, bg_rgba });
        }
    }
    if cells.len() != declared_len {
        return Err(SnapshotDecodeError::SizeMismatch);
    }
    Ok(cells)
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
