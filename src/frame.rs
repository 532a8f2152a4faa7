//! Link-layer frame codec
//!
//! Frames on the pump serial link are delimited by a begin-of-message byte (0xC0)
//! and an end-of-message byte (0xC1). Everything between them is byte-stuffed so
//! that neither marker nor the escape byte (0x7D) appears inside the frame:
//! a reserved byte `b` travels as `0x7D, b ^ 0x20`.
//!
//! Unstuffed frame layout: `[address][control][payload...][crc_lo][crc_hi]`, where
//! the CRC-16/KERMIT checksum covers address, control and payload.

use crate::types::{hex_dump, FrameType, PumpError, Result};
use log::{debug, warn};
use std::time::{Duration, Instant};

pub const BOM: u8 = 0xC0;
pub const EOM: u8 = 0xC1;
pub const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;

/// Payload prefix the device uses to report a protocol-level error
pub const DEVICE_ERROR_MARKER: [u8; 2] = [0xFF, 0xEE];

/// Default buffer timeout in milliseconds
const BUFFER_TIMEOUT_MS: u64 = 1500;

/// Address, control and CRC bytes
const MIN_FRAME_LEN: usize = 4;

/// One link-layer frame as received from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub address: u8,
    pub control: u8,
    pub payload: Vec<u8>,
    /// False when the checksum did not match or the frame was truncated
    pub valid: bool,
}

impl RawFrame {
    pub fn frame_type(&self) -> Result<FrameType> {
        FrameType::from_u8(self.control)
    }
}

/// CRC-16/KERMIT over the given bytes
pub fn calculate_crc(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn is_reserved(byte: u8) -> bool {
    byte == BOM || byte == EOM || byte == ESCAPE
}

/// Byte-stuff frame content so no reserved byte appears unescaped
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8 + 2);
    for &byte in data {
        if is_reserved(byte) {
            out.push(ESCAPE);
            out.push(byte ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
    out
}

/// Reverse byte-stuffing. Returns None on a dangling escape byte.
pub fn unescape(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&byte) = iter.next() {
        if byte == ESCAPE {
            let &next = iter.next()?;
            out.push(next ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
    Some(out)
}

/// Build a complete, delimited frame ready to be written to the transport
pub fn build_frame(address: u8, control: u8, payload: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(payload.len() + MIN_FRAME_LEN);
    content.push(address);
    content.push(control);
    content.extend_from_slice(payload);
    let crc = calculate_crc(&content);
    content.extend_from_slice(&crc.to_le_bytes());

    let mut frame = Vec::with_capacity(content.len() * 2 + 2);
    frame.push(BOM);
    frame.extend(escape(&content));
    frame.push(EOM);
    frame
}

/// Frame decoder with buffering support for a half-duplex byte stream
pub struct FrameCodec {
    buffer: Vec<u8>,
    last_update: Option<Instant>,
    buffer_timeout: Duration,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new codec with default timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_millis(BUFFER_TIMEOUT_MS))
    }

    /// Create a new codec with custom timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            buffer: Vec::with_capacity(1024),
            last_update: None,
            buffer_timeout: timeout,
        }
    }

    /// Accumulate received bytes in the internal buffer
    ///
    /// A partial frame left untouched for longer than the buffer timeout is dropped.
    pub fn receive_bytes(&mut self, bytes: &[u8]) {
        let now = Instant::now();

        if let Some(last_update) = self.last_update {
            if now.duration_since(last_update) > self.buffer_timeout && !self.buffer.is_empty() {
                debug!("Dropping {} stale buffered bytes", self.buffer.len());
                self.reset();
            }
        }

        self.last_update = Some(now);
        self.buffer.extend_from_slice(bytes);
    }

    /// Reset the internal buffer
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes waiting in the buffer
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Check if a delimited frame is available
    pub fn has_frame(&self) -> bool {
        match self.buffer.iter().position(|&b| b == BOM) {
            Some(start) => self.buffer[start + 1..].contains(&EOM),
            None => false,
        }
    }

    /// Extract the next frame from the buffer
    ///
    /// Returns `Ok(None)` while the end marker has not arrived yet. A frame with a
    /// bad checksum is returned with `valid == false` and the rest of the buffer is
    /// flushed. A payload carrying the device error marker is surfaced as
    /// [`PumpError::DeviceReported`].
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        let start = match self.buffer.iter().position(|&b| b == BOM) {
            Some(start) => start,
            None => {
                if !self.buffer.is_empty() {
                    debug!("Discarding {} bytes without frame start", self.buffer.len());
                    self.buffer.clear();
                }
                return Ok(None);
            }
        };
        if start > 0 {
            debug!("Discarding {} bytes of leading garbage", start);
            self.buffer.drain(..start);
        }

        let end = match self.buffer[1..].iter().position(|&b| b == EOM) {
            Some(offset) => offset + 1,
            None => return Ok(None),
        };

        let stuffed: Vec<u8> = self.buffer.drain(..=end).collect();
        let content = match unescape(&stuffed[1..stuffed.len() - 1]) {
            Some(content) if content.len() >= MIN_FRAME_LEN => content,
            _ => {
                warn!("Malformed frame ({}), flushing buffer", hex_dump(&stuffed));
                self.buffer.clear();
                return Ok(Some(RawFrame {
                    address: 0,
                    control: 0,
                    payload: Vec::new(),
                    valid: false,
                }));
            }
        };

        let body_len = content.len() - 2;
        let expected = calculate_crc(&content[..body_len]);
        let got = u16::from_le_bytes([content[body_len], content[body_len + 1]]);
        let frame = RawFrame {
            address: content[0],
            control: content[1],
            payload: content[2..body_len].to_vec(),
            valid: expected == got,
        };

        if !frame.valid {
            warn!(
                "Checksum mismatch (expected 0x{:04X}, got 0x{:04X}), flushing {} buffered bytes",
                expected,
                got,
                self.buffer.len()
            );
            self.buffer.clear();
            return Ok(Some(frame));
        }

        if frame.payload.starts_with(&DEVICE_ERROR_MARKER) {
            let code = frame.payload.get(2).copied().unwrap_or(0);
            return Err(PumpError::DeviceReported(code));
        }

        debug!(
            "Frame decoded: addr=0x{:02X} ctrl=0x{:02X} payload=[{}]",
            frame.address,
            frame.control,
            hex_dump(&frame.payload)
        );
        Ok(Some(frame))
    }
}
