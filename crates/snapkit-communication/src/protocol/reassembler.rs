//! Incremental frame reassembly for the serial receive path
//!
//! Serial reads return whatever the OS buffered, so frames arrive split across
//! reads or several to a read. The reassembler keeps an accumulator across
//! calls to [`FrameReassembler::feed`] and emits each checksum-valid payload
//! once it is complete.
//!
//! Corruption policy: a bad marker, zero length or inconsistent length-verify
//! byte resynchronizes by skipping ahead; a frame whose checksum fails is
//! consumed whole and counted as dropped. Nothing here returns an error.
//!
//! A bad second marker byte skips two bytes, unless that byte is itself a
//! first marker byte, which may open the next frame.

use super::frame::{
    length_verify, parse_frame, verify_checksum, ParsedFrame, HEADER_LEN, INDEX_LEN, MARKER_HI,
    MARKER_LO, MIN_FRAME_LEN,
};
use snapkit_core::{ProtocolError, ProtocolVersion};

/// A validated payload, header stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Version byte from the frame header
    pub version: u8,
    /// Event id of the frame
    pub event_id: u8,
    /// Payload with the event id excluded
    pub content: Vec<u8>,
}

impl Payload {
    /// Sequence index of an indexed frame
    pub fn sequence_index(&self) -> Option<u32> {
        if self.version != ProtocolVersion::Indexed.version_byte() {
            return None;
        }
        let index: [u8; INDEX_LEN] = self.content.get(..INDEX_LEN)?.try_into().ok()?;
        Some(u32::from_be_bytes(index))
    }

    /// Content with the sequence index of indexed frames removed
    pub fn body(&self) -> &[u8] {
        match self.sequence_index() {
            Some(_) => &self.content[INDEX_LEN..],
            None => &self.content,
        }
    }

    /// Parse into event id, content and decoded status
    pub fn parse(&self) -> Result<ParsedFrame, ProtocolError> {
        let mut buffer = Vec::with_capacity(1 + self.body().len());
        buffer.push(self.event_id);
        buffer.extend_from_slice(self.body());
        parse_frame(&buffer)
    }
}

/// Counters describing link health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    /// Frames emitted
    pub frames_emitted: u64,
    /// Frames dropped on checksum failure
    pub frames_dropped: u64,
    /// Bytes skipped while resynchronizing
    pub bytes_skipped: u64,
}

/// Stateful stream-to-frame transform
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buffer: Vec<u8>,
    stats: ReassemblerStats,
}

impl FrameReassembler {
    /// Create an empty reassembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every payload completed by it
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Payload> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        let mut pos = 0;

        while self.buffer.len() - pos >= MIN_FRAME_LEN {
            let acc = &self.buffer[pos..];

            if acc[0] != MARKER_HI {
                pos += 1;
                self.stats.bytes_skipped += 1;
                continue;
            }
            if acc[1] != MARKER_LO {
                let skip = if acc[1] == MARKER_HI { 1 } else { 2 };
                pos += skip;
                self.stats.bytes_skipped += skip as u64;
                continue;
            }

            let length = u16::from_be_bytes([acc[2], acc[3]]);
            if length == 0 || acc[5] != length_verify(length) {
                tracing::debug!("Inconsistent frame length {:#06x}, resynchronizing", length);
                pos += 2;
                self.stats.bytes_skipped += 2;
                continue;
            }

            let total = HEADER_LEN + usize::from(length);
            if acc.len() < total {
                break;
            }

            let expected = u16::from_be_bytes([acc[6], acc[7]]);
            let payload = &acc[HEADER_LEN..total];
            if verify_checksum(expected, payload) {
                payloads.push(Payload {
                    version: acc[4],
                    event_id: payload[0],
                    content: payload[1..].to_vec(),
                });
                self.stats.frames_emitted += 1;
            } else {
                self.stats.frames_dropped += 1;
                tracing::warn!(
                    "Dropping frame with bad checksum {:#06x} (event {:#04x}, {} bytes, {} dropped so far)",
                    expected,
                    payload[0],
                    length,
                    self.stats.frames_dropped
                );
            }
            pos += total;
        }

        self.buffer.drain(..pos);
        payloads
    }

    /// Return whatever is still buffered, unvalidated, and reset
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// Bytes waiting for the rest of a frame
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Link health counters
    pub fn stats(&self) -> ReassemblerStats {
        self.stats
    }
}
