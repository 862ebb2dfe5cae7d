//! Data models shared across the communication layer
//!
//! This module provides:
//! - Connection type and connection status of the session
//! - Machine-reported workflow status
//! - Live machine state (positions, homing, enclosure, modules, temperatures)
//! - Saved connection credentials used for reconnection

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Transport used to reach a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Local serial / USB port
    #[default]
    Serial,
    /// Networked machine reached over HTTP
    WiFi,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => write!(f, "serial"),
            Self::WiFi => write!(f, "wifi"),
        }
    }
}

/// Connection lifecycle status of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// No connection and no attempt in flight
    #[default]
    Idle,
    /// A connect attempt is in flight
    Connecting,
    /// Waiting for the user to confirm on the machine's touchscreen
    RequireAuth,
    /// Connected
    Connected,
}

impl ConnectionStatus {
    /// Whether a machine is open (connected or awaiting confirmation)
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Connected | Self::RequireAuth)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::RequireAuth => write!(f, "require-auth"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Machine-reported execution state, independent of the connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// Not reported yet
    #[default]
    Unknown,
    /// Idle, ready for a job
    Idle,
    /// Job paused
    Paused,
    /// Pause requested, machine still decelerating
    Pausing,
    /// Job running
    Running,
    /// Job stopped
    Stopped,
}

impl WorkflowStatus {
    /// Parse the status string reported by the HTTP API (`IDLE`, `RUNNING`, ...)
    pub fn from_api(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "IDLE" => Self::Idle,
            "RUNNING" => Self::Running,
            "PAUSED" => Self::Paused,
            "PAUSING" => Self::Pausing,
            "STOPPED" | "STOPPING" => Self::Stopped,
            _ => Self::Unknown,
        }
    }

    /// Map the print-state byte of a serial status record
    pub fn from_print_state(state: u8) -> Self {
        match state {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Paused,
            3 => Self::Stopped,
            4 => Self::Pausing,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Idle => write!(f, "idle"),
            Self::Paused => write!(f, "paused"),
            Self::Pausing => write!(f, "pausing"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Tool head mounted on the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadType {
    /// 3D printing extruder
    Printing,
    /// Laser module
    Laser,
    /// CNC spindle
    Cnc,
}

impl HeadType {
    /// Parse the tool head identifier reported by the machine
    pub fn from_api(tool_head: &str) -> Option<Self> {
        let upper = tool_head.to_ascii_uppercase();
        if upper.contains("3DP") || upper.contains("PRINT") {
            Some(Self::Printing)
        } else if upper.contains("LASER") {
            Some(Self::Laser)
        } else if upper.contains("CNC") {
            Some(Self::Cnc)
        } else {
            None
        }
    }

    /// Map the head-state byte of a serial status record
    pub fn from_head_state(state: u8) -> Option<Self> {
        match state {
            1 => Some(Self::Printing),
            2 => Some(Self::Cnc),
            3 => Some(Self::Laser),
            _ => None,
        }
    }
}

/// Four-axis position (X, Y, Z and the rotary B axis)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X-axis position
    pub x: f64,
    /// Y-axis position
    pub y: f64,
    /// Z-axis position
    pub z: f64,
    /// Rotary B axis, if fitted
    pub b: Option<f64>,
}

impl Position {
    /// Create a new position with X, Y, Z coordinates
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z, b: None }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.b {
            Some(b) => write!(
                f,
                "X:{:.2} Y:{:.2} Z:{:.2} B:{:.2}",
                self.x, self.y, self.z, b
            ),
            None => write!(f, "X:{:.2} Y:{:.2} Z:{:.2}", self.x, self.y, self.z),
        }
    }
}

/// Live machine state held by the session while a machine is open
///
/// Reset to defaults on every disconnect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    /// Work position
    pub work_position: Position,
    /// Work origin offset relative to machine zero
    pub origin_offset: Position,
    /// Whether the machine has been homed since power-up
    pub is_homed: bool,
    /// Enclosure door open
    pub is_enclosure_door_open: bool,
    /// Attached modules (name → present)
    pub module_status: BTreeMap<String, bool>,
    /// Mounted tool head
    pub head_type: Option<HeadType>,
    /// Nozzle temperature, actual
    pub nozzle_temperature: f64,
    /// Nozzle temperature, target
    pub nozzle_target_temperature: f64,
    /// Heated bed temperature, actual
    pub bed_temperature: f64,
    /// Heated bed temperature, target
    pub bed_target_temperature: f64,
    /// Laser power in percent
    pub laser_power: f64,
    /// Spindle speed in RPM
    pub spindle_speed: f64,
}

/// Credentials remembered for reconnecting to the last machine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedConnection {
    /// Connection type of the saved machine
    pub connection_type: ConnectionType,
    /// Machine name
    pub name: String,
    /// Network address (empty for serial machines)
    pub address: String,
    /// Serial port path (empty for networked machines)
    #[serde(default)]
    pub port: String,
    /// Session token (networked machines only)
    #[serde(default)]
    pub token: Option<String>,
}

impl SavedConnection {
    /// Whether anything has been saved yet
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.address.is_empty() && self.port.is_empty()
    }
}

/// Version of the serial frame layout spoken by a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Fixed header, no sequence index (version byte 0)
    #[default]
    V0,
    /// Fixed header plus a 4-byte sequence index after the event id (version byte 1)
    Indexed,
}

impl ProtocolVersion {
    /// Value carried in the frame's version byte
    pub fn version_byte(&self) -> u8 {
        match self {
            Self::V0 => 0,
            Self::Indexed => 1,
        }
    }
}
