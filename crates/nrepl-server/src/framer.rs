// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! Message framing over a continuous byte stream
//!
//! Clients use one of two conventions:
//! - length-prefixed: `<decimal length>:<bencode>` (or a 4-byte big-endian
//!   binary header whose first byte is `0x00`)
//! - raw: back-to-back bencode dictionaries, delimited by a bracket-depth scan
//!
//! The convention is detected from the leading byte and latched by the first
//! complete message; after that every message on the connection is framed the
//! same way. Bytes that cannot start a message are discarded one at a time.

use crate::codec::{MAX_NESTING_DEPTH, MAX_STRING_LENGTH};
use std::ops::Range;
use tracing::trace;

/// Longest decimal length run accepted before a length is considered garbage
pub const MAX_LENGTH_DIGITS: usize = 20;

/// Size of the binary length header
const BINARY_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    LengthPrefixed,
    Raw,
}

/// Outcome of scanning for the end of a bencode value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanResult {
    /// Exclusive end offset of the first complete top-level container
    Complete(usize),
    /// More bytes are required
    Incomplete,
    /// A string length is not a usable number
    Invalid,
}

/// Find the end of the first top-level dictionary or list in `data`
///
/// String bodies and integer digits are skipped verbatim, so `d`, `l`, `e`
/// and digits inside them never affect the nesting depth. Nesting deeper
/// than [`MAX_NESTING_DEPTH`] is `Invalid`.
pub fn find_bencode_end(data: &[u8]) -> ScanResult {
    Scanner::default().scan(data)
}

/// Resumable state of [`find_bencode_end`]
///
/// `pos` always sits on a token boundary, so a scan that returned
/// `Incomplete` can continue once more bytes have been appended to the same
/// buffer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Scanner {
    pos: usize,
    depth: usize,
}

impl Scanner {
    fn scan(&mut self, data: &[u8]) -> ScanResult {
        while self.pos < data.len() {
            match data[self.pos] {
                b'd' | b'l' => {
                    self.depth += 1;
                    if self.depth > MAX_NESTING_DEPTH {
                        return ScanResult::Invalid;
                    }
                }
                b'e' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return ScanResult::Complete(self.pos + 1);
                    }
                }
                b'i' => match data[self.pos + 1..].iter().position(|&b| b == b'e') {
                    // The closing 'e' belongs to the integer, not to a container
                    Some(offset) => self.pos += offset + 1,
                    None => return ScanResult::Incomplete,
                },
                b'0'..=b'9' => {
                    let start = self.pos;
                    let run = data[start..].iter().take_while(|b| b.is_ascii_digit()).count();
                    if run > MAX_LENGTH_DIGITS {
                        return ScanResult::Invalid;
                    }
                    let colon = start + run;
                    match data.get(colon) {
                        None => return ScanResult::Incomplete,
                        Some(b':') => {}
                        Some(_) => return ScanResult::Invalid,
                    }
                    let Some(len) = parse_length(&data[start..colon]) else {
                        return ScanResult::Invalid;
                    };
                    let body_end = colon + 1 + len;
                    if body_end > data.len() {
                        return ScanResult::Incomplete;
                    }
                    self.pos = body_end;
                    continue;
                }
                _ => {}
            }
            self.pos += 1;
        }

        ScanResult::Incomplete
    }
}

fn parse_length(digits: &[u8]) -> Option<usize> {
    std::str::from_utf8(digits)
        .ok()?
        .parse::<usize>()
        .ok()
        .filter(|&len| len <= MAX_STRING_LENGTH)
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Frame {
        format: FrameFormat,
        body: Range<usize>,
        consumed: usize,
    },
    Skip,
    NeedMore,
}

/// Per-connection framer holding the latched wire convention
#[derive(Debug, Default, Clone)]
pub struct Framer {
    format: Option<FrameFormat>,
    /// Progress through an incomplete raw message at the front of the buffer
    scan: Scanner,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A framer that is already latched, e.g. for reading replies client-side
    pub fn with_format(format: FrameFormat) -> Self {
        Self {
            format: Some(format),
            ..Self::default()
        }
    }

    pub fn format(&self) -> Option<FrameFormat> {
        self.format
    }

    pub fn is_length_prefixed(&self) -> bool {
        self.format == Some(FrameFormat::LengthPrefixed)
    }

    /// Remove the next complete message body from the front of `buf`
    ///
    /// Framing overhead and noise bytes are drained along with it. Returns
    /// `None` when `buf` does not yet hold a complete message. Between calls
    /// the caller may only append to `buf`; a partial raw message is not
    /// rescanned from the start.
    pub fn next_frame(&mut self, buf: &mut Vec<u8>) -> Option<Vec<u8>> {
        loop {
            match self.step(buf) {
                Step::Frame {
                    format,
                    body,
                    consumed,
                } => {
                    self.format.get_or_insert(format);
                    self.scan = Scanner::default();
                    let frame = buf[body].to_vec();
                    buf.drain(..consumed);
                    return Some(frame);
                }
                Step::Skip => {
                    trace!(byte = buf[0], "discarding noise byte");
                    self.scan = Scanner::default();
                    buf.drain(..1);
                }
                Step::NeedMore => return None,
            }
        }
    }

    fn step(&mut self, buf: &[u8]) -> Step {
        let Some(&first) = buf.first() else {
            return Step::NeedMore;
        };

        let format = match self.format {
            Some(format) => format,
            None => match first {
                b'0'..=b'9' => FrameFormat::LengthPrefixed,
                b'd' => FrameFormat::Raw,
                0x00 => FrameFormat::LengthPrefixed,
                _ => return Step::Skip,
            },
        };

        match format {
            FrameFormat::LengthPrefixed => length_prefixed_step(buf),
            FrameFormat::Raw => self.raw_step(buf),
        }
    }

    fn raw_step(&mut self, buf: &[u8]) -> Step {
        if buf[0] != b'd' {
            return Step::Skip;
        }
        match self.scan.scan(buf) {
            ScanResult::Complete(end) => Step::Frame {
                format: FrameFormat::Raw,
                body: 0..end,
                consumed: end,
            },
            ScanResult::Incomplete => Step::NeedMore,
            ScanResult::Invalid => Step::Skip,
        }
    }
}

fn length_prefixed_step(buf: &[u8]) -> Step {
    match buf[0] {
        b'0'..=b'9' => {
            let run = buf.iter().take_while(|b| b.is_ascii_digit()).count();
            if run > MAX_LENGTH_DIGITS {
                return Step::Skip;
            }
            match buf.get(run) {
                None => return Step::NeedMore,
                Some(b':') => {}
                Some(_) => return Step::Skip,
            }
            let Some(len) = parse_length(&buf[..run]) else {
                return Step::Skip;
            };
            complete_frame(buf, run + 1, len)
        }
        0x00 => {
            if buf.len() <= BINARY_HEADER_LEN {
                return Step::NeedMore;
            }
            if buf[BINARY_HEADER_LEN] != b'd' {
                return Step::Skip;
            }
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            complete_frame(buf, BINARY_HEADER_LEN, len)
        }
        _ => Step::Skip,
    }
}

fn complete_frame(buf: &[u8], header_len: usize, len: usize) -> Step {
    let total = header_len + len;
    if buf.len() < total {
        return Step::NeedMore;
    }
    Step::Frame {
        format: FrameFormat::LengthPrefixed,
        body: header_len..total,
        consumed: total,
    }
}
