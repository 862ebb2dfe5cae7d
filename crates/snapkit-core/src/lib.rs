//! # SnapKit Core
//!
//! Core types shared by the SnapKit crates: the error taxonomy, the
//! connection / machine data model, the event bus and the persistence seam
//! for saved connection credentials.

pub mod data;
pub mod error;
pub mod event_bus;
pub mod store;

pub use data::{
    ConnectionStatus, ConnectionType, HeadType, MachineState, Position, ProtocolVersion,
    SavedConnection, WorkflowStatus,
};

pub use error::{ConnectionError, ControllerError, Error, ProtocolError, Result};

pub use event_bus::{
    AppEvent, ConnectionEvent, DisconnectReason, DiscoveryEvent, EventBus, EventBusConfig,
    EventCategory, EventFilter, MachineEvent, MachineSummary, ProtocolEvent, SubscriptionId,
};

pub use store::{MemoryConnectionStore, SavedConnectionStore};
