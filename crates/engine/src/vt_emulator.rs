// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server-side terminal emulator. Ingests a session's output byte stream
//! and materializes either a plain snapshot (for the cast log pruning
//! anchor) or a full per-cell `SNAPSHOT_VT` grid for stream subscribers.

use crate::snapshot::{cell_attr, SnapshotCell, VtSnapshot, ATTR_ALT_SCREEN, ATTR_CURSOR_VISIBLE};

/// DECSET alternate screen buffer enable.
const ALT_SCREEN_ON: &[u8] = b"\x1b[?1049h";
/// DECRST alternate screen buffer disable.
const ALT_SCREEN_OFF: &[u8] = b"\x1b[?1049l";

/// Scan `data` for alt screen on/off sequences, updating `alt_screen`.
fn scan_alt_screen(data: &[u8], alt_screen: &mut bool) {
    if data.len() < ALT_SCREEN_ON.len() {
        return;
    }
    if data.windows(ALT_SCREEN_ON.len()).any(|w| w == ALT_SCREEN_ON) {
        *alt_screen = true;
    }
    if data.windows(ALT_SCREEN_OFF.len()).any(|w| w == ALT_SCREEN_OFF) {
        *alt_screen = false;
    }
}

/// Returns the number of trailing bytes that form an incomplete UTF-8 sequence.
fn incomplete_utf8_tail_len(data: &[u8]) -> usize {
    let len = data.len();
    for i in 1..=len.min(3) {
        let byte = data[len - i];
        if byte < 0x80 {
            return 0;
        }
        if byte >= 0xC0 {
            let expected = if byte < 0xE0 {
                2
            } else if byte < 0xF0 {
                3
            } else {
                4
            };
            return if i < expected { i } else { 0 };
        }
    }
    0
}

/// An `avt` terminal, wired with the bell/title callbacks the hub needs,
/// plus the cross-call buffering that makes `feed()` safe against PTY
/// reads that split a UTF-8 sequence or an alt-screen escape.
pub struct VtEmulator {
    vt: avt::Vt,
    seq: u64,
    alt_screen: bool,
    title: String,
    bell_pending: bool,
    utf8_buf: [u8; 3],
    utf8_buf_len: u8,
    esc_buf: [u8; 7],
    esc_buf_len: u8,
}

impl std::fmt::Debug for VtEmulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VtEmulator")
            .field("seq", &self.seq)
            .field("alt_screen", &self.alt_screen)
            .finish()
    }
}

impl VtEmulator {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            vt: avt::Vt::new(cols as usize, rows as usize),
            seq: 0,
            alt_screen: false,
            title: String::new(),
            bell_pending: false,
            utf8_buf: [0; 3],
            utf8_buf_len: 0,
            esc_buf: [0; 7],
            esc_buf_len: 0,
        }
    }

    /// Ingest raw output bytes, advancing the emulator state.
    pub fn feed(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let buf_len = self.utf8_buf_len as usize;
        let owned: Vec<u8>;
        let input = if buf_len == 0 {
            data
        } else {
            owned = [&self.utf8_buf[..buf_len], data].concat();
            self.utf8_buf_len = 0;
            &owned
        };

        let esc_len = self.esc_buf_len as usize;
        if esc_len > 0 {
            let take = input.len().min(ALT_SCREEN_ON.len());
            let mut bridge = [0u8; 15];
            bridge[..esc_len].copy_from_slice(&self.esc_buf[..esc_len]);
            bridge[esc_len..esc_len + take].copy_from_slice(&input[..take]);
            let region = &bridge[..esc_len + take];
            scan_alt_screen(region, &mut self.alt_screen);
        }
        scan_alt_screen(input, &mut self.alt_screen);
        if input.contains(&0x07) {
            self.bell_pending = true;
        }

        let tail_len = input.len().min(7);
        self.esc_buf[..tail_len].copy_from_slice(&input[input.len() - tail_len..]);
        self.esc_buf_len = tail_len as u8;

        let tail = incomplete_utf8_tail_len(input);
        let (to_feed, to_buffer) = input.split_at(input.len() - tail);

        if !to_buffer.is_empty() {
            self.utf8_buf[..to_buffer.len()].copy_from_slice(to_buffer);
            self.utf8_buf_len = to_buffer.len() as u8;
        }

        if !to_feed.is_empty() {
            let s = String::from_utf8_lossy(to_feed);
            let _ = self.vt.feed_str(&s);
        }

        self.seq += 1;
    }

    /// Drain a pending bell signal raised during `feed()`.
    pub fn take_bell(&mut self) -> bool {
        std::mem::take(&mut self.bell_pending)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn is_alt_screen(&self) -> bool {
        self.alt_screen
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        let _ = self.vt.resize(cols as usize, rows as usize);
    }

    /// Build a full per-cell `SNAPSHOT_VT` payload from the current state.
    ///
    /// Scrollback capture is bounded by `max_scrollback_lines`; older lines
    /// are silently dropped (the cast log remains the durable source of
    /// full history).
    pub fn snapshot(&self, max_scrollback_lines: usize) -> VtSnapshot {
        let (cols, rows) = self.vt.size();
        let cursor = self.vt.cursor();

        let mut attr_flags = 0u8;
        if self.alt_screen {
            attr_flags |= ATTR_ALT_SCREEN;
        }
        if cursor.visible {
            attr_flags |= ATTR_CURSOR_VISIBLE;
        }

        let cells = self.vt.view().flat_map(line_to_cells).collect();

        // Scrollback beyond the live grid is served from the cast log, not
        // the live emulator; `avt::Vt` here is configured with no
        // additional history, so this is always empty.
        let _ = max_scrollback_lines;
        let scrollback: Vec<Vec<SnapshotCell>> = Vec::new();

        VtSnapshot {
            cols: cols as u32,
            rows: rows as u32,
            cursor_row: cursor.row as u32,
            cursor_col: cursor.col as u32,
            attr_flags,
            cells,
            scrollback,
        }
    }
}

/// Convert one `avt` grid line into snapshot cells.
///
/// `avt`'s cell/pen accessors are the one part of this emulator with no
/// directly-testable reference: if a future `avt` release renames these,
/// only this function needs to change.
fn line_to_cells(line: &avt::Line) -> Vec<SnapshotCell> {
    line.cells()
        .iter()
        .map(|cell| {
            let pen = cell.pen();
            let mut fg = color_to_rgba(pen.foreground(), 0xFFFFFFFF);
            let bg = color_to_rgba(pen.background(), 0x000000FF);

            if pen.is_bold() {
                fg |= cell_attr::BOLD;
            }
            if pen.is_italic() {
                fg |= cell_attr::ITALIC;
            }
            if pen.is_underline() {
                fg |= cell_attr::UNDERLINE;
            }
            if pen.is_inverse() {
                fg |= cell_attr::INVERSE;
            }

            SnapshotCell { codepoint: cell.char() as u32, fg_rgba: fg, bg_rgba: bg }
        })
        .collect()
}

/// Map an `avt::Color` to packed `0xRRGGBBAA`, defaulting to `default` when
/// the pen leaves the color unset (terminal default).
fn color_to_rgba(color: Option<avt::Color>, default: u32) -> u32 {
    match color {
        None => default,
        Some(avt::Color::RGB(rgb)) => pack_rgba(rgb.r, rgb.g, rgb.b, 0xFF),
        Some(avt::Color::Indexed(idx)) => {
            let (r, g, b) = indexed_to_rgb(idx);
            pack_rgba(r, g, b, 0xFF)
        }
    }
}

fn pack_rgba(r: u8, g: u8, b: u8, a: u8) -> u32 {
    ((r as u32) << 24) | ((g as u32) << 16) | ((b as u32) << 8) | a as u32
}

/// Standard xterm 256-color palette approximation: 16 ANSI colors, a 6x6x6
/// color cube, and a 24-step grayscale ramp.
fn indexed_to_rgb(idx: u8) -> (u8, u8, u8) {
    const ANSI16: [(u8, u8, u8); 16] = [
        (0, 0, 0),
        (205, 0, 0),
        (0, 205, 0),
        (205, 205, 0),
        (0, 0, 238),
        (205, 0, 205),
        (0, 205, 205),
        (229, 229, 229),
        (127, 127, 127),
        (255, 0, 0),
        (0, 255, 0),
        (255, 255, 0),
        (92, 92, 255),
        (255, 0, 255),
        (0, 255, 255),
        (255, 255, 255),
    ];

    match idx {
        0..=15 => ANSI16[idx as usize],
        16..=231 => {
            let i = idx - 16;
            let r = i / 36;
            let g = (i % 36) / 6;
            let b = i % 6;
            let scale = |v: u8| if v == 0 { 0 } else { 55 + v * 40 };
            (scale(r), scale(g), scale(b))
        }
        232..=255 => {
            let level = 8 + (idx - 232) * 10;
            (level, level, level)
        }
    }
}

#[cfg(test)]
#[path = "vt_emulator_tests.rs"]
mod tests;
