//! Machine status record carried by status-sync responses
//!
//! Layout after the leading sub-event id (protocol version 0, fixed offsets):
//!
//! | field | bytes |
//! |---|---|
//! | x, y, z, e position | 4 each, BE i32 (micrometres) |
//! | bed actual, bed target, head actual, head target | 2 each, BE u16 |
//! | feed rate | 2, BE u16 |
//! | laser power, spindle speed | 4 each, BE u32 |
//! | print state, outer state, head state | 1 each |

use super::event_id::StatusSyncCommand;
use serde::{Deserialize, Serialize};
use snapkit_core::{HeadType, MachineState, Position, WorkflowStatus};

/// Size of the record, excluding the sub-event id
pub const STATUS_RECORD_LEN: usize = 37;

/// Positionally decoded machine status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// X position
    pub x: i32,
    /// Y position
    pub y: i32,
    /// Z position
    pub z: i32,
    /// Extruder position
    pub e: i32,
    /// Bed temperature, actual
    pub bed_temperature: u16,
    /// Bed temperature, target
    pub bed_target_temperature: u16,
    /// Head temperature, actual
    pub head_temperature: u16,
    /// Head temperature, target
    pub head_target_temperature: u16,
    /// Feed rate
    pub feed_rate: u16,
    /// Laser power
    pub laser_power: u32,
    /// Spindle speed
    pub spindle_speed: u32,
    /// Print state
    pub print_state: u8,
    /// Outer (enclosure) state
    pub outer_state: u8,
    /// Head state
    pub head_state: u8,
}

/// Big-endian reader that yields zero once the input runs out
struct ZeroFillReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ZeroFillReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        for byte in out.iter_mut() {
            *byte = self.data.get(self.pos).copied().unwrap_or(0);
            self.pos += 1;
        }
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_be_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take())
    }

    fn i32(&mut self) -> i32 {
        i32::from_be_bytes(self.take())
    }
}

impl StatusRecord {
    /// Decode status-sync response content (sub-event id first)
    ///
    /// Anything other than a status query reply decodes to an all-zero
    /// record; short content is zero-filled. Never fails.
    pub fn decode(content: &[u8]) -> Self {
        match content.split_first() {
            Some((&sub, body)) if sub == StatusSyncCommand::QueryStatus as u8 => {
                Self::decode_body(body)
            }
            _ => Self::default(),
        }
    }

    fn decode_body(body: &[u8]) -> Self {
        let mut r = ZeroFillReader::new(body);
        Self {
            x: r.i32(),
            y: r.i32(),
            z: r.i32(),
            e: r.i32(),
            bed_temperature: r.u16(),
            bed_target_temperature: r.u16(),
            head_temperature: r.u16(),
            head_target_temperature: r.u16(),
            feed_rate: r.u16(),
            laser_power: r.u32(),
            spindle_speed: r.u32(),
            print_state: r.u8(),
            outer_state: r.u8(),
            head_state: r.u8(),
        }
    }

    /// Encode as status-sync response content, sub-event id included
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + STATUS_RECORD_LEN);
        out.push(StatusSyncCommand::QueryStatus as u8);
        for v in [self.x, self.y, self.z, self.e] {
            out.extend_from_slice(&v.to_be_bytes());
        }
        for v in [
            self.bed_temperature,
            self.bed_target_temperature,
            self.head_temperature,
            self.head_target_temperature,
            self.feed_rate,
        ] {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out.extend_from_slice(&self.laser_power.to_be_bytes());
        out.extend_from_slice(&self.spindle_speed.to_be_bytes());
        out.extend_from_slice(&[self.print_state, self.outer_state, self.head_state]);
        out
    }

    /// Workflow status implied by the print state
    pub fn workflow_status(&self) -> WorkflowStatus {
        WorkflowStatus::from_print_state(self.print_state)
    }

    /// Fold this record into the live machine state
    pub fn apply_to(&self, state: &mut MachineState) {
        state.work_position = Position::new(
            f64::from(self.x) / 1000.0,
            f64::from(self.y) / 1000.0,
            f64::from(self.z) / 1000.0,
        );
        state.bed_temperature = f64::from(self.bed_temperature);
        state.bed_target_temperature = f64::from(self.bed_target_temperature);
        state.nozzle_temperature = f64::from(self.head_temperature);
        state.nozzle_target_temperature = f64::from(self.head_target_temperature);
        state.laser_power = f64::from(self.laser_power);
        state.spindle_speed = f64::from(self.spindle_speed);
        state.is_enclosure_door_open = self.outer_state != 0;
        if let Some(head) = HeadType::from_head_state(self.head_state) {
            state.head_type = Some(head);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_print_state_only() {
        let mut content = vec![0u8; 38];
        content[0] = StatusSyncCommand::QueryStatus as u8;
        content[35] = 0x02;

        let record = StatusRecord::decode(&content);
        assert_eq!(
            record,
            StatusRecord {
                print_state: 2,
                ..Default::default()
            }
        );
        assert_eq!(record.workflow_status(), WorkflowStatus::Paused);
    }

    #[test]
    fn test_decode_signed_positions() {
        let record = StatusRecord {
            x: -12_500,
            y: 40_000,
            z: 1,
            laser_power: 70,
            head_state: 3,
            ..Default::default()
        };
        let content = record.encode();
        assert_eq!(content.len(), 1 + STATUS_RECORD_LEN);
        assert_eq!(StatusRecord::decode(&content), record);

        let mut state = MachineState::default();
        record.apply_to(&mut state);
        assert_eq!(state.work_position.x, -12.5);
        assert_eq!(state.head_type, Some(HeadType::Laser));
    }

    #[test]
    fn test_unknown_sub_event_is_zero() {
        let mut content = vec![0xffu8; 38];
        content[0] = 0x06;
        assert_eq!(StatusRecord::decode(&content), StatusRecord::default());
        assert_eq!(StatusRecord::decode(&[]), StatusRecord::default());
    }

    #[test]
    fn test_short_content_zero_filled() {
        let content = [0x01, 0x00, 0x00, 0x00, 0x05];
        let record = StatusRecord::decode(&content);
        assert_eq!(record.x, 5);
        assert_eq!(record.print_state, 0);
    }
}
