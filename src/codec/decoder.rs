//! Incremental envelope decoder for a byte stream.

use super::wire::{check_length, frame_type, Envelope};
use crate::error::{BridgeError, Result};

/// Incremental decoder that handles partial reads.
///
/// Feed bytes via [`EnvelopeDecoder::feed`] and extract complete envelopes.
/// Incomplete data is buffered until the next call.
#[derive(Debug, Default)]
pub struct EnvelopeDecoder {
    buf: Vec<u8>,
}

impl EnvelopeDecoder {
    /// Creates a decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes into the decoder and extracts all complete envelopes.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::MalformedFrame`] if a length prefix is zero or
    /// over the size limit, or the type byte is unknown. The length prefix is
    /// checked as soon as it arrives, before the payload is buffered.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Envelope>> {
        self.buf.extend_from_slice(bytes);
        let mut envelopes = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }

            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            check_length(length)?;

            let total = 4 + length as usize;
            if self.buf.len() < total {
                break; // Incomplete, wait for more data
            }

            let kind = self.buf[4];
            if !frame_type::is_known(kind) {
                return Err(BridgeError::malformed(format!(
                    "unknown envelope type: 0x{kind:02x}"
                )));
            }
            envelopes.push(Envelope::new(kind, self.buf[5..total].to_vec()));
            self.buf.drain(..total);
        }

        Ok(envelopes)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
