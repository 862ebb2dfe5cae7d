//! Communication module
//!
//! One async [`Transport`] trait over the two carriers a machine can be
//! reached by: a framed serial link and the networked HTTP controller API.
//! Transports push unsolicited traffic (status reports, dropped-frame counts,
//! link loss) through a broadcast side channel returned by
//! [`Transport::subscribe`].

pub mod network;
pub mod pending;
pub mod serial;

use crate::protocol::{Packet, ParsedFrame, StatusSyncCommand};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snapkit_core::{ConnectionType, MachineState, Result, WorkflowStatus};
use tokio::sync::broadcast;

pub use network::{NetworkStatus, NetworkTransport, DEFAULT_HTTP_PORT};
pub use pending::PendingRequests;
pub use serial::{
    list_ports, LinkFactory, RealSerialLink, SerialLink, SerialPortInfo, SerialTransport,
    DEFAULT_BAUD_RATE,
};

/// Capacity of each transport's event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outcome of opening a transport
///
/// `msg` is empty on success; a non-empty message reports a protocol-level
/// refusal that is not a transport failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResult {
    /// Status code (HTTP status for networked machines, 200 for an opened port)
    pub code: u16,
    /// Failure message, empty on success
    pub msg: String,
    /// Session token issued by a networked machine
    pub token: Option<String>,
}

impl ConnectResult {
    /// Successful open with no token
    pub fn ok() -> Self {
        Self {
            code: 200,
            ..Default::default()
        }
    }

    /// Whether the open succeeded
    pub fn is_ok(&self) -> bool {
        self.msg.is_empty()
    }
}

/// Application-level result of a correlated request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Status code, 200 on success
    pub code: u16,
    /// Failure message, empty on success
    pub msg: String,
    /// Optional payload (a stop response uses it to report partial failure)
    pub data: Option<serde_json::Value>,
}

impl CommandResponse {
    /// Successful response without payload
    pub fn ok() -> Self {
        Self {
            code: 200,
            ..Default::default()
        }
    }

    /// Attach a payload
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Whether the machine accepted the command
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code) && self.msg.is_empty()
    }
}

/// Machine workflow status and state captured by one status poll
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Machine-reported workflow status
    pub workflow_status: WorkflowStatus,
    /// Live machine state
    pub state: MachineState,
}

/// Result of a status poll
#[derive(Debug, Clone, PartialEq)]
pub enum StatusPoll {
    /// The machine answered with its status
    Ready(StatusSnapshot),
    /// The machine is waiting for the user to confirm on its touchscreen
    AwaitingAuth,
}

/// Requests understood by both transports, plus raw serial packets
#[derive(Debug, Clone, PartialEq)]
pub enum MachineRequest {
    /// One or more G-code lines
    Gcode(String),
    /// Start the loaded print job
    StartPrint,
    /// Pause the running job
    PausePrint,
    /// Resume a paused job
    ResumePrint,
    /// Stop the running job
    StopPrint,
    /// Poll machine status
    QueryStatus,
    /// Pre-built packet (serial transports only)
    Packet(Packet),
}

impl MachineRequest {
    /// Short name used in logs and errors
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Gcode(_) => "execute_gcode",
            Self::StartPrint => "start_print",
            Self::PausePrint => "pause_print",
            Self::ResumePrint => "resume_print",
            Self::StopPrint => "stop_print",
            Self::QueryStatus => "query_status",
            Self::Packet(_) => "serial_packet",
        }
    }

    /// Serial packet carrying this request
    pub fn to_packet(&self) -> Packet {
        match self {
            Self::Gcode(gcode) => Packet::gcode(gcode),
            Self::StartPrint => Packet::status_sync(StatusSyncCommand::StartPrint),
            Self::PausePrint => Packet::status_sync(StatusSyncCommand::Pause),
            Self::ResumePrint => Packet::status_sync(StatusSyncCommand::Resume),
            Self::StopPrint => Packet::status_sync(StatusSyncCommand::Stop),
            Self::QueryStatus => Packet::query_status(),
            Self::Packet(packet) => packet.clone(),
        }
    }
}

/// Unsolicited traffic from a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A frame no pending request claimed
    Frame(ParsedFrame),
    /// A status report
    Status(StatusSnapshot),
    /// A frame failed its checksum
    FrameDropped {
        /// Frames dropped on this link so far
        total_dropped: u64,
    },
    /// The link closed
    Closed {
        /// Why it closed
        reason: String,
    },
}

/// Uniform carrier for talking to one machine
#[async_trait]
pub trait Transport: Send + Sync {
    /// Carrier kind
    fn connection_type(&self) -> ConnectionType;

    /// Whether the carrier is currently open
    fn is_connected(&self) -> bool;

    /// Open the carrier
    async fn connect(&self) -> Result<ConnectResult>;

    /// Close the carrier; `force` tears down locally without waiting on the remote
    async fn disconnect(&self, force: bool) -> Result<()>;

    /// Fire-and-forget; resolves once the carrier accepted the request
    async fn send(&self, request: MachineRequest) -> Result<()>;

    /// Send and wait for the correlated response
    async fn request(&self, request: MachineRequest) -> Result<CommandResponse>;

    /// Poll machine status
    async fn query_status(&self) -> Result<StatusPoll>;

    /// Side channel for unsolicited traffic
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Session token, if the carrier uses one
    fn token(&self) -> Option<String> {
        None
    }

    /// Replace the session token; ignored by carriers without auth
    fn set_token(&self, _token: Option<String>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventId;

    #[test]
    fn test_request_packets() {
        let packet = MachineRequest::StopPrint.to_packet();
        assert_eq!(packet.event_id, EventId::StatusSyncRequest);
        assert_eq!(packet.content, vec![0x06]);

        let gcode = MachineRequest::Gcode("G28\n".into()).to_packet();
        assert_eq!(gcode.content, b"G28".to_vec());
    }

    #[test]
    fn test_command_response_is_ok() {
        assert!(CommandResponse::ok().is_ok());
        let rejected = CommandResponse {
            code: 500,
            msg: "busy".into(),
            data: None,
        };
        assert!(!rejected.is_ok());
    }
}
