//! Envelope framing shared by both directions of the channel.
//!
//! Every message is length-prefixed with a type byte:
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! Envelope types:
//! - `0x01`: action (controller→simulator) - UTF-8 JSON object
//! - `0x02`: step (simulator→controller) - binary step payload, see [`super::frame`]

use crate::constants::MAX_ENVELOPE_SIZE;
use crate::error::{BridgeError, Result};

/// Envelope type constants.
pub mod frame_type {
    /// Action command (controller → simulator).
    pub const ACTION: u8 = 0x01;
    /// Step observation (simulator → controller).
    pub const STEP: u8 = 0x02;

    /// Returns `true` for a type byte this protocol defines.
    pub fn is_known(kind: u8) -> bool {
        matches!(kind, ACTION | STEP)
    }
}

/// One length-delimited message, payload not yet interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Type byte, one of [`frame_type`].
    pub kind: u8,
    /// Payload bytes following the type byte.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wraps a payload with its type.
    pub fn new(kind: u8, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Encodes this envelope into wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        encode_envelope(self.kind, &self.payload)
    }
}

/// Encodes a raw envelope with type byte and payload.
///
/// Returns `[u32 LE length][u8 type][payload]`.
pub fn encode_envelope(kind: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32; // +1 for type byte
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(kind);
    buf.extend_from_slice(payload);
    buf
}

/// Checks a length prefix before any payload is buffered.
pub(crate) fn check_length(length: u32) -> Result<()> {
    if length == 0 {
        return Err(BridgeError::malformed("zero-length envelope"));
    }
    if length > MAX_ENVELOPE_SIZE {
        return Err(BridgeError::malformed(format!(
            "envelope too large: {length} bytes (max {MAX_ENVELOPE_SIZE})"
        )));
    }
    Ok(())
}

/// Bounds-checked little-endian reader over one section of a payload.
///
/// Every read names the field it expects, so a short section reports
/// exactly which declared length did not match.
#[derive(Debug)]
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(BridgeError::malformed(format!(
                "{what} declares {len} bytes, only {remaining} remain"
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    pub(crate) fn u32(&mut self, what: &str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self, what: &str) -> Result<u64> {
        let b = self.take(8, what)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }
}
