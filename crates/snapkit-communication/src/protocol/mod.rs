//! Serial wire protocol
//!
//! - `frame`: header layout, checksum, build / parse
//! - `reassembler`: byte stream to validated payloads
//! - `packet`: request construction for every category and sub-command
//! - `status`: positional decode of machine status reports
//! - `event_id`: category and sub-command taxonomy

pub mod event_id;
pub mod frame;
pub mod packet;
pub mod reassembler;
pub mod status;

pub use event_id::{EventId, FileCommand, SettingsCommand, StatusSyncCommand};
pub use frame::{
    build_frame, build_indexed_frame, build_versioned_frame, checksum, decode_focal_length,
    parse_frame, strip_header, verify_checksum, ParsedFrame,
};
pub use packet::{sanitize_gcode, Packet, ResponseKey};
pub use reassembler::{FrameReassembler, Payload, ReassemblerStats};
pub use status::StatusRecord;
