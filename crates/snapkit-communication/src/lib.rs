//! # SnapKit Communication
//!
//! Everything between the UI and a Snapmaker machine:
//! - the SACP-style frame codec and stream reassembler
//! - serial and HTTP transports behind one [`Transport`] trait
//! - per-machine agents and the single-machine connection session
//! - serial and UDP broadcast discovery

pub mod agent;
pub mod communication;
pub mod discovery;
pub mod protocol;
pub mod session;

pub use agent::{
    coordinate_move_gcode, go_home_gcode, set_work_origin_gcode, AgentInfo, Axis,
    GcodePrintingInfo, MachineAgent, MoveOrder, PrintProgress, TransportOptions,
};

pub use communication::{
    list_ports, CommandResponse, ConnectResult, MachineRequest, NetworkStatus, NetworkTransport,
    SerialPortInfo, SerialTransport, StatusPoll, StatusSnapshot, Transport, TransportEvent,
    DEFAULT_BAUD_RATE, DEFAULT_HTTP_PORT,
};

pub use discovery::{
    reconcile, DiscoveredMachine, DiscoveryConfig, DiscoveryService, Reconciled, ScanKind,
};

pub use protocol::{FrameReassembler, Packet, ParsedFrame, Payload};

pub use session::{ConnectionSession, HeartbeatConfig};
