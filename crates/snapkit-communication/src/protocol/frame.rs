//! Frame codec for the serial wire protocol
//!
//! ```text
//! offset 0-1: marker        0xAA 0x55
//! offset 2-3: length        big-endian u16 (= 1 + len(content))
//! offset 4:   version       0x00 (0x01 for indexed frames)
//! offset 5:   length verify (length >> 8) ^ (length & 0xff)
//! offset 6-7: checksum      big-endian u16 over [event id] + content
//! offset 8:   event id
//! offset 9..: content
//! ```
//!
//! Indexed frames insert a big-endian u32 sequence index between the event id
//! and the content; the index counts towards both length and checksum.

use super::status::StatusRecord;
use super::event_id::{EventId, SettingsCommand, StatusSyncCommand};
use snapkit_core::{ProtocolError, ProtocolVersion};

/// First marker byte
pub const MARKER_HI: u8 = 0xAA;
/// Second marker byte
pub const MARKER_LO: u8 = 0x55;
/// Size of the fixed header preceding the event id
pub const HEADER_LEN: usize = 8;
/// Smallest complete frame: header plus event id
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 1;
/// Largest content that fits the 16-bit length field alongside the event id
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize - 1;
/// Size of the sequence index carried by indexed frames
pub const INDEX_LEN: usize = 4;

/// Ones'-complement 16-bit checksum with carry folding
///
/// Sums big-endian byte pairs, adds an odd trailing byte on its own, folds
/// carries back into the low 16 bits and returns the inverted result.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut pairs = data.chunks_exact(2);
    for pair in &mut pairs {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = pairs.remainder() {
        sum += u32::from(*last);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Check a transmitted checksum against the payload it covers
pub fn verify_checksum(expected: u16, payload: &[u8]) -> bool {
    checksum(payload) == expected
}

/// Redundancy byte derived from the length field
pub fn length_verify(length: u16) -> u8 {
    ((length >> 8) as u8) ^ (length as u8)
}

/// Build a version 0 frame
pub fn build_frame(event_id: u8, content: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if content.len() > MAX_CONTENT_LEN {
        return Err(ProtocolError::ContentTooLong { len: content.len() });
    }
    let mut payload = Vec::with_capacity(1 + content.len());
    payload.push(event_id);
    payload.extend_from_slice(content);
    Ok(encode(ProtocolVersion::V0.version_byte(), &payload))
}

/// Build an indexed frame carrying `index` ahead of the content
pub fn build_indexed_frame(
    event_id: u8,
    index: u32,
    content: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    if content.len() + INDEX_LEN > MAX_CONTENT_LEN {
        return Err(ProtocolError::ContentTooLong { len: content.len() });
    }
    let mut payload = Vec::with_capacity(1 + INDEX_LEN + content.len());
    payload.push(event_id);
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(content);
    Ok(encode(ProtocolVersion::Indexed.version_byte(), &payload))
}

/// Build a frame in the layout of `version`; `index` is ignored for V0
pub fn build_versioned_frame(
    version: ProtocolVersion,
    event_id: u8,
    index: u32,
    content: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    match version {
        ProtocolVersion::V0 => build_frame(event_id, content),
        ProtocolVersion::Indexed => build_indexed_frame(event_id, index, content),
    }
}

fn encode(version: u8, payload: &[u8]) -> Vec<u8> {
    let length = payload.len() as u16;
    let [len_hi, len_lo] = length.to_be_bytes();
    let [ck_hi, ck_lo] = checksum(payload).to_be_bytes();

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&[
        MARKER_HI,
        MARKER_LO,
        len_hi,
        len_lo,
        version,
        length_verify(length),
        ck_hi,
        ck_lo,
    ]);
    frame.extend_from_slice(payload);
    frame
}

/// Drop the fixed header of an encoded frame, leaving `[event id] + content`
pub fn strip_header(frame: &[u8]) -> &[u8] {
    frame.get(HEADER_LEN..).unwrap_or(&[])
}

/// A delimited payload split into event id and content
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFrame {
    /// Event id byte
    pub event_id: u8,
    /// Content following the event id
    pub content: Vec<u8>,
    /// Decoded status record for status-sync responses
    pub status: Option<StatusRecord>,
}

impl ParsedFrame {
    /// Known event id, if the byte is in the taxonomy
    pub fn event(&self) -> Option<EventId> {
        EventId::from_u8(self.event_id)
    }

    /// Leading sub-event id of multiplexed categories
    pub fn sub_event_id(&self) -> Option<u8> {
        self.content.first().copied()
    }

    /// Whether this is a reply to a machine status query
    pub fn is_status_report(&self) -> bool {
        self.event_id == EventId::StatusSyncResponse.as_u8()
            && self.sub_event_id() == Some(StatusSyncCommand::QueryStatus as u8)
    }

    /// Sub-command and value bytes of a settings response
    pub fn settings_report(&self) -> Option<(SettingsCommand, &[u8])> {
        if self.event_id != EventId::SettingsResponse.as_u8() {
            return None;
        }
        let (&sub, value) = self.content.split_first()?;
        Some((SettingsCommand::from_u8(sub)?, value))
    }
}

/// Laser focal length in millimetres from its BE micrometre encoding
pub fn decode_focal_length(value: &[u8]) -> Option<f64> {
    let raw: [u8; 4] = value.get(..4)?.try_into().ok()?;
    Some(f64::from(u32::from_be_bytes(raw)) / 1000.0)
}

/// Parse a payload already delimited by the reassembler
///
/// `buffer[0]` is the event id, the rest is content. Status-sync responses get
/// their content decoded into a [`StatusRecord`].
pub fn parse_frame(buffer: &[u8]) -> Result<ParsedFrame, ProtocolError> {
    let (&event_id, content) = buffer.split_first().ok_or(ProtocolError::EmptyFrame)?;

    let status = (event_id == EventId::StatusSyncResponse.as_u8())
        .then(|| StatusRecord::decode(content));

    Ok(ParsedFrame {
        event_id,
        content: content.to_vec(),
        status,
    })
}
