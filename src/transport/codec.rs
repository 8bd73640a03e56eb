//! Byte framing and JSON payload encoding for stream transports
//!
//! Serial links carry one JSON object per frame. Frames are delimited either
//! with SLIP (RFC 1055) or with newlines. Decoders are incremental: feed
//! whatever bytes arrived and pull out complete frames as they appear.

use crate::error::{RadapterError, Result};
use crate::message::{into_payload, Message, Payload};

/// SLIP frame delimiter
pub const SLIP_END: u8 = 0xC0;
/// SLIP escape byte
pub const SLIP_ESC: u8 = 0xDB;
/// Escaped END
pub const SLIP_ESC_END: u8 = 0xDC;
/// Escaped ESC
pub const SLIP_ESC_ESC: u8 = 0xDD;

/// Largest frame accepted before the decoder discards its buffer
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Incremental frame decoder
pub trait FrameDecoder: Send {
    /// Append raw bytes
    fn feed(&mut self, bytes: &[u8]);

    /// Next complete frame, if any
    ///
    /// Malformed or oversized frames come back as `Err` and are discarded.
    fn next_frame(&mut self) -> Option<Result<Vec<u8>>>;

    /// Discard partial input
    fn reset(&mut self);
}

/// Wrap `data` in a SLIP frame, with a leading END to flush line noise
pub fn slip_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2);
    out.push(SLIP_END);
    for &b in data {
        match b {
            SLIP_END => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
            SLIP_ESC => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
            other => out.push(other),
        }
    }
    out.push(SLIP_END);
    out
}

/// Streaming SLIP decoder
#[derive(Debug, Default)]
pub struct SlipDecoder {
    pending: std::collections::VecDeque<u8>,
    frame: Vec<u8>,
    escaped: bool,
    corrupt: Option<String>,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish_frame(&mut self) -> Option<Result<Vec<u8>>> {
        let escaped = std::mem::take(&mut self.escaped);
        if let Some(reason) = self.corrupt.take() {
            self.frame.clear();
            return Some(Err(RadapterError::Framing(reason)));
        }
        if escaped {
            self.frame.clear();
            return Some(Err(RadapterError::Framing(
                "SLIP frame ended inside an escape".to_string(),
            )));
        }
        if self.frame.is_empty() {
            return None;
        }
        Some(Ok(std::mem::take(&mut self.frame)))
    }
}

impl FrameDecoder for SlipDecoder {
    fn feed(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes);
    }

    fn next_frame(&mut self) -> Option<Result<Vec<u8>>> {
        while let Some(b) = self.pending.pop_front() {
            if b == SLIP_END {
                if let Some(frame) = self.finish_frame() {
                    return Some(frame);
                }
                continue;
            }
            if self.corrupt.is_some() {
                continue;
            }
            if self.escaped {
                self.escaped = false;
                match b {
                    SLIP_ESC_END => self.frame.push(SLIP_END),
                    SLIP_ESC_ESC => self.frame.push(SLIP_ESC),
                    other => {
                        self.corrupt = Some(format!("invalid SLIP escape 0x{:02X}", other));
                    }
                }
            } else if b == SLIP_ESC {
                self.escaped = true;
            } else {
                self.frame.push(b);
            }
            if self.frame.len() > MAX_FRAME_LEN && self.corrupt.is_none() {
                self.frame.clear();
                self.corrupt = Some(format!("SLIP frame exceeds {} bytes", MAX_FRAME_LEN));
            }
        }
        None
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.frame.clear();
        self.escaped = false;
        self.corrupt = None;
    }
}

/// Newline delimited decoder; `\r\n` is accepted and blank lines skipped
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    overflow: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameDecoder for LineDecoder {
    fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next_frame(&mut self) -> Option<Result<Vec<u8>>> {
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                if self.buffer.len() > MAX_FRAME_LEN {
                    self.buffer.clear();
                    self.overflow = true;
                }
                return None;
            };
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if std::mem::take(&mut self.overflow) {
                return Some(Err(RadapterError::Framing(format!(
                    "line exceeds {} bytes",
                    MAX_FRAME_LEN
                ))));
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(Ok(line));
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.overflow = false;
    }
}

/// Parse one frame into a payload
///
/// Non-object JSON values are wrapped as `{"value": ...}`.
pub fn decode_payload(frame: &[u8]) -> Result<Payload> {
    let value: serde_json::Value = serde_json::from_slice(frame)
        .map_err(|e| RadapterError::Framing(format!("invalid JSON frame: {}", e)))?;
    Ok(into_payload(value))
}

/// Serialize a message payload for the wire
pub fn encode_payload(message: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message.payload())?)
}
