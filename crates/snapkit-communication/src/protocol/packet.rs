//! Request packet construction
//!
//! A [`Packet`] is an event id plus content, not yet framed. Framing happens
//! at send time because the sequence index of indexed frames is assigned by
//! the pending-request table.

use super::event_id::{EventId, FileCommand, SettingsCommand, StatusSyncCommand};
use super::frame::build_versioned_frame;
use snapkit_core::{ProtocolError, ProtocolVersion};

/// Key a response is matched on: response event id plus sub-event id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseKey {
    /// Response event id
    pub event_id: u8,
    /// Sub-event id for multiplexed categories
    pub sub_event_id: Option<u8>,
}

impl ResponseKey {
    /// Whether a received (event id, content) pair answers this key
    pub fn matches(&self, event_id: u8, content: &[u8]) -> bool {
        self.event_id == event_id
            && self
                .sub_event_id
                .map_or(true, |sub| content.first() == Some(&sub))
    }
}

/// Unframed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Request event id
    pub event_id: EventId,
    /// Request content (sub-event id first for multiplexed categories)
    pub content: Vec<u8>,
}

/// Strip line terminators and blank lines, joining commands with `\n`
pub fn sanitize_gcode(gcode: &str) -> String {
    gcode
        .lines()
        .map(|line| line.trim_end_matches('\r').trim_end())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

impl Packet {
    /// Create a packet from raw parts
    pub fn new(event_id: EventId, content: Vec<u8>) -> Self {
        Self { event_id, content }
    }

    /// G-code request; one or several newline-separated commands
    pub fn gcode(gcode: &str) -> Self {
        Self::new(EventId::GcodeRequest, sanitize_gcode(gcode).into_bytes())
    }

    /// Status-sync request with no arguments
    pub fn status_sync(command: StatusSyncCommand) -> Self {
        Self::new(EventId::StatusSyncRequest, vec![command as u8])
    }

    /// Query machine status
    pub fn query_status() -> Self {
        Self::status_sync(StatusSyncCommand::QueryStatus)
    }

    /// Settings request with no arguments
    pub fn settings(command: SettingsCommand) -> Self {
        Self::new(EventId::SettingsRequest, vec![command as u8])
    }

    /// Start manual calibration, or go to calibration point `point`
    pub fn manual_calibration(point: u8) -> Self {
        Self::new(
            EventId::SettingsRequest,
            vec![SettingsCommand::ManualCalibration as u8, point],
        )
    }

    /// Move the current calibration point by `offset_mm` (sent as micrometres)
    pub fn move_calibration_point(offset_mm: f64) -> Self {
        let micrometres = (offset_mm * 1000.0).round() as i32;
        let mut content = vec![SettingsCommand::MoveCalibrationPoint as u8];
        content.extend_from_slice(&micrometres.to_be_bytes());
        Self::new(EventId::SettingsRequest, content)
    }

    /// Mount on-board storage
    pub fn mount_storage() -> Self {
        Self::new(EventId::FileOperationRequest, vec![FileCommand::Mount as u8])
    }

    /// List files, optionally rewinding to the first entry
    pub fn list_files(rewind: bool) -> Self {
        Self::new(
            EventId::FileOperationRequest,
            vec![FileCommand::ListFiles as u8, u8::from(rewind)],
        )
    }

    /// Print a file stored on the machine
    pub fn print_file(file_name: &str) -> Self {
        let mut content = vec![FileCommand::PrintFile as u8];
        content.extend_from_slice(file_name.as_bytes());
        Self::new(EventId::FileOperationRequest, content)
    }

    /// Whether the content leads with a sub-event id
    pub fn is_multiplexed(&self) -> bool {
        matches!(
            self.event_id,
            EventId::StatusSyncRequest | EventId::SettingsRequest | EventId::FileOperationRequest
        )
    }

    /// Key the matching response will carry
    pub fn response_key(&self) -> ResponseKey {
        ResponseKey {
            event_id: self.event_id.response().as_u8(),
            sub_event_id: if self.is_multiplexed() {
                self.content.first().copied()
            } else {
                None
            },
        }
    }

    /// Frame this packet in the layout of `version`
    pub fn encode(&self, version: ProtocolVersion, index: u32) -> Result<Vec<u8>, ProtocolError> {
        build_versioned_frame(version, self.event_id.as_u8(), index, &self.content)
    }
}
