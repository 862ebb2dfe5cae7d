//! Event type definitions for the event bus.
//!
//! Events are organized by category. Every event also carries the wire-level
//! name the UI layer listens for (`connection:connected`, `Marlin:state`, ...).

use serde::{Deserialize, Serialize};

use crate::data::{ConnectionType, MachineState, WorkflowStatus};

/// Root event enum for all events leaving the communication layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AppEvent {
    /// Connection lifecycle events
    Connection(ConnectionEvent),
    /// Machine discovery events
    Discovery(DiscoveryEvent),
    /// Machine status and settings reports
    Machine(MachineEvent),
    /// Wire protocol diagnostics
    Protocol(ProtocolEvent),
}

impl AppEvent {
    /// Get the category of this event
    pub fn category(&self) -> EventCategory {
        match self {
            AppEvent::Connection(_) => EventCategory::Connection,
            AppEvent::Discovery(_) => EventCategory::Discovery,
            AppEvent::Machine(_) => EventCategory::Machine,
            AppEvent::Protocol(_) => EventCategory::Protocol,
        }
    }

    /// Name the UI layer subscribes to
    pub fn name(&self) -> &'static str {
        match self {
            AppEvent::Connection(e) => e.name(),
            AppEvent::Discovery(e) => e.name(),
            AppEvent::Machine(e) => e.name(),
            AppEvent::Protocol(e) => e.name(),
        }
    }

    /// Get a short description of this event for logging
    pub fn description(&self) -> String {
        match self {
            AppEvent::Connection(e) => e.description(),
            AppEvent::Discovery(e) => e.description(),
            AppEvent::Machine(e) => e.description(),
            AppEvent::Protocol(e) => e.description(),
        }
    }
}

/// Event category for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Connection lifecycle events.
    Connection,
    /// Discovery events.
    Discovery,
    /// Machine state and settings events.
    Machine,
    /// Protocol diagnostics.
    Protocol,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::Connection => write!(f, "Connection"),
            EventCategory::Discovery => write!(f, "Discovery"),
            EventCategory::Machine => write!(f, "Machine"),
            EventCategory::Protocol => write!(f, "Protocol"),
        }
    }
}

/// Reason for a connection closing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// User requested disconnect
    UserRequested,
    /// Administrative reset at startup or reload
    Reset,
    /// Machine rejected the session token
    Unauthorized,
    /// Connection lost unexpectedly
    ConnectionLost,
}

/// Connection lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Connect attempt started.
    Connecting {
        /// Machine name.
        name: String,
        /// Transport used.
        connection_type: ConnectionType,
    },
    /// Waiting for the user to confirm on the touchscreen.
    RequireAuth {
        /// Machine name.
        name: String,
    },
    /// Connection established.
    Connected {
        /// Machine name.
        name: String,
        /// Address or port of the machine.
        address: String,
        /// Transport used.
        connection_type: ConnectionType,
    },
    /// Connect attempt failed.
    ConnectionFailed {
        /// Machine name.
        name: String,
        /// Short error code.
        code: String,
        /// Human-readable message.
        error: String,
    },
    /// Connection closed.
    Closed {
        /// Machine name.
        name: String,
        /// Why the connection closed.
        reason: DisconnectReason,
    },
}

impl ConnectionEvent {
    fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Connecting { .. } => "connection:connecting",
            ConnectionEvent::RequireAuth { .. } => "connection:require-auth",
            ConnectionEvent::Connected { .. } => "connection:connected",
            ConnectionEvent::ConnectionFailed { .. } => "connection:failed",
            ConnectionEvent::Closed { .. } => "connection:close",
        }
    }

    fn description(&self) -> String {
        match self {
            ConnectionEvent::Connecting {
                name,
                connection_type,
            } => format!("Connecting to {} over {}", name, connection_type),
            ConnectionEvent::RequireAuth { name } => {
                format!("Waiting for confirmation on {}", name)
            }
            ConnectionEvent::Connected { name, address, .. } => {
                format!("Connected to {} ({})", name, address)
            }
            ConnectionEvent::ConnectionFailed { name, code, error } => {
                format!("Connection to {} failed [{}]: {}", name, code, error)
            }
            ConnectionEvent::Closed { name, reason } => {
                format!("Connection to {} closed: {:?}", name, reason)
            }
        }
    }
}

/// Summary of a known machine as seen by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSummary {
    /// Machine name
    pub name: String,
    /// Network address, empty for serial machines
    pub address: String,
    /// Serial port path, empty for networked machines
    pub port: String,
    /// Model reported by the machine, if any
    pub model: Option<String>,
    /// Whether the user added this entry by hand
    pub added_by_user: bool,
}

/// Discovery events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DiscoveryEvent {
    /// Networked machine list changed.
    NetworkMachines {
        /// Current list of networked machines.
        machines: Vec<MachineSummary>,
    },
    /// Serial port list changed.
    SerialPorts {
        /// Current list of serial machines.
        machines: Vec<MachineSummary>,
    },
}

impl DiscoveryEvent {
    fn name(&self) -> &'static str {
        match self {
            DiscoveryEvent::NetworkMachines { .. } => "machine:discover",
            DiscoveryEvent::SerialPorts { .. } => "machine:serial-discover",
        }
    }

    fn description(&self) -> String {
        match self {
            DiscoveryEvent::NetworkMachines { machines } => {
                format!("{} networked machine(s)", machines.len())
            }
            DiscoveryEvent::SerialPorts { machines } => {
                format!("{} serial port(s)", machines.len())
            }
        }
    }
}

/// Machine status and settings reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MachineEvent {
    /// Periodic machine state.
    State {
        /// Machine-reported workflow status.
        workflow_status: WorkflowStatus,
        /// Live machine state.
        state: MachineState,
    },
    /// A settings value reported by the machine.
    Settings {
        /// Setting name.
        setting: String,
        /// Reported value.
        value: serde_json::Value,
    },
}

impl MachineEvent {
    fn name(&self) -> &'static str {
        match self {
            MachineEvent::State { .. } => "Marlin:state",
            MachineEvent::Settings { .. } => "Marlin:settings",
        }
    }

    fn description(&self) -> String {
        match self {
            MachineEvent::State {
                workflow_status,
                state,
            } => format!("{} at {}", workflow_status, state.work_position),
            MachineEvent::Settings { setting, value } => format!("{} = {}", setting, value),
        }
    }
}

/// Wire protocol diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtocolEvent {
    /// A frame failed its checksum and was discarded.
    FrameDropped {
        /// Frames dropped on this link so far.
        total_dropped: u64,
    },
}

impl ProtocolEvent {
    fn name(&self) -> &'static str {
        match self {
            ProtocolEvent::FrameDropped { .. } => "protocol:frame-dropped",
        }
    }

    fn description(&self) -> String {
        match self {
            ProtocolEvent::FrameDropped { total_dropped } => {
                format!("Frame dropped ({} total)", total_dropped)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborator_event_names() {
        let connecting = AppEvent::Connection(ConnectionEvent::Connecting {
            name: "A350".to_string(),
            connection_type: ConnectionType::WiFi,
        });
        assert_eq!(connecting.name(), "connection:connecting");
        assert_eq!(connecting.category(), EventCategory::Connection);

        let closed = AppEvent::Connection(ConnectionEvent::Closed {
            name: "A350".to_string(),
            reason: DisconnectReason::UserRequested,
        });
        assert_eq!(closed.name(), "connection:close");

        let serial = AppEvent::Discovery(DiscoveryEvent::SerialPorts { machines: vec![] });
        assert_eq!(serial.name(), "machine:serial-discover");

        let state = AppEvent::Machine(MachineEvent::State {
            workflow_status: WorkflowStatus::Idle,
            state: MachineState::default(),
        });
        assert_eq!(state.name(), "Marlin:state");
    }
}
