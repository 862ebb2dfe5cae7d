//! Machine agent
//!
//! One agent per known machine, found by discovery or entered by the user.
//! The agent owns the machine's transport and exposes the command API the UI
//! drives; connection bookkeeping lives in the session.

mod printing;

pub use printing::{GcodePrintingInfo, PrintProgress};

use crate::communication::{
    CommandResponse, ConnectResult, MachineRequest, NetworkTransport, SerialTransport, StatusPoll,
    Transport, TransportEvent, DEFAULT_BAUD_RATE, DEFAULT_HTTP_PORT,
};
use crate::protocol::{decode_focal_length, Packet, SettingsCommand};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snapkit_core::{
    ConnectionError, ConnectionType, ControllerError, HeadType, MachineSummary, ProtocolError,
    ProtocolVersion, Result,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Identity and link parameters of a machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Display name
    pub name: String,
    /// Network address, empty for serial-only machines
    pub address: String,
    /// Serial port path, empty for networked machines
    pub port: String,
    /// Serial baud rate
    pub baud_rate: u32,
    /// Serial frame layout
    pub protocol: ProtocolVersion,
    /// Model reported in the discovery reply
    pub model: Option<String>,
    /// Status reported in the discovery reply
    pub reported_status: Option<String>,
    /// Entered by the user; survives discovery refreshes
    pub added_by_user: bool,
}

impl AgentInfo {
    /// Machine on a serial port, named after the port
    pub fn serial(port: impl Into<String>) -> Self {
        let port = port.into();
        Self {
            name: port.clone(),
            address: String::new(),
            port,
            baud_rate: DEFAULT_BAUD_RATE,
            protocol: ProtocolVersion::default(),
            model: None,
            reported_status: None,
            added_by_user: false,
        }
    }

    /// Machine reachable over the network
    pub fn network(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            protocol: ProtocolVersion::default(),
            model: None,
            reported_status: None,
            added_by_user: false,
        }
    }

    /// Set the serial baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the serial frame layout
    pub fn with_protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set the model reported by discovery
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Set the status reported by discovery
    pub fn with_reported_status(mut self, status: Option<String>) -> Self {
        self.reported_status = status;
        self
    }

    /// Mark as entered by the user
    pub fn added_by_user(mut self, added_by_user: bool) -> Self {
        self.added_by_user = added_by_user;
        self
    }

    /// Whether the machine is reached over the network
    pub fn is_networked_machine(&self) -> bool {
        !self.address.is_empty()
    }

    /// Transport kind
    pub fn connection_type(&self) -> ConnectionType {
        if self.is_networked_machine() {
            ConnectionType::WiFi
        } else {
            ConnectionType::Serial
        }
    }

    /// Check the parameters a transport needs before opening it
    pub fn validate(&self) -> Result<()> {
        if self.is_networked_machine() {
            return Ok(());
        }
        let reason = if self.port.trim().is_empty() {
            "serial port is empty".to_string()
        } else if self.baud_rate == 0 {
            format!("baud rate of {} is zero", self.port)
        } else {
            return Ok(());
        };
        Err(ConnectionError::InvalidParameters { reason }.into())
    }
}

/// Parameters used when building an agent's transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Controller API port of networked machines
    pub http_port: u16,
    /// Response deadline for correlated requests
    pub request_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Axis addressed by a jog move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// X axis
    X,
    /// Y axis
    Y,
    /// Z axis
    Z,
    /// Rotary axis
    B,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X => write!(f, "X"),
            Self::Y => write!(f, "Y"),
            Self::Z => write!(f, "Z"),
            Self::B => write!(f, "B"),
        }
    }
}

/// One axis target of a coordinate move
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveOrder {
    /// Axis to move
    pub axis: Axis,
    /// Target (or offset, after a `G91` prelude)
    pub position: f64,
}

impl MoveOrder {
    /// Create a move order
    pub fn new(axis: Axis, position: f64) -> Self {
        Self { axis, position }
    }
}

/// G-code for a jog: the caller's prelude, one rapid move, then back to absolute mode
///
/// Rotary targets are skipped for printing heads.
pub fn coordinate_move_gcode(
    move_orders: &[MoveOrder],
    gcode: &str,
    jog_speed: f64,
    head_type: Option<HeadType>,
) -> String {
    let mut lines = Vec::new();
    let prelude = gcode.trim();
    if !prelude.is_empty() {
        lines.push(prelude.to_string());
    }

    let targets: Vec<String> = move_orders
        .iter()
        .filter(|order| !(order.axis == Axis::B && head_type == Some(HeadType::Printing)))
        .map(|order| format!("{}{}", order.axis, order.position))
        .collect();
    if !targets.is_empty() {
        lines.push(format!("G0 {} F{}", targets.join(" "), jog_speed));
    }

    if prelude
        .lines()
        .any(|line| line.trim().eq_ignore_ascii_case("G91"))
    {
        lines.push("G90".to_string());
    }
    lines.join("\n")
}

/// G-code setting the current position as work origin
pub fn set_work_origin_gcode(x: f64, y: f64, z: f64, b: Option<f64>) -> String {
    match b {
        Some(b) => format!("G92 X{} Y{} Z{} B{}", x, y, z, b),
        None => format!("G92 X{} Y{} Z{}", x, y, z),
    }
}

/// G-code homing the given axes, or all axes when empty
pub fn go_home_gcode(axes: &[Axis]) -> String {
    let mut gcode = String::from("G28");
    for axis in axes {
        gcode.push(' ');
        gcode.push_str(&axis.to_string());
    }
    gcode
}

fn response_bytes(response: &CommandResponse) -> Vec<u8> {
    response
        .data
        .as_ref()
        .and_then(|data| data.as_array())
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect()
        })
        .unwrap_or_default()
}

/// A known machine and its transport
pub struct MachineAgent {
    id: Uuid,
    info: AgentInfo,
    transport: Arc<dyn Transport>,
    printing: Mutex<GcodePrintingInfo>,
}

impl MachineAgent {
    /// Create an agent, building its transport from `info`
    pub fn new(info: AgentInfo, options: &TransportOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| ConnectionError::Http {
                reason: e.to_string(),
            })?;
        Ok(Self::with_client(info, &client, options))
    }

    /// Create an agent whose networked transport shares `client`
    pub fn with_client(info: AgentInfo, client: &reqwest::Client, options: &TransportOptions) -> Self {
        let transport: Arc<dyn Transport> = if info.is_networked_machine() {
            Arc::new(NetworkTransport::with_client(
                client.clone(),
                info.address.clone(),
                options.http_port,
                options.request_timeout,
            ))
        } else {
            Arc::new(SerialTransport::new(
                info.port.clone(),
                info.baud_rate,
                info.protocol,
                options.request_timeout,
            ))
        };
        Self::with_transport(info, transport)
    }

    /// Create an agent over an existing transport
    pub fn with_transport(info: AgentInfo, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: Uuid::new_v4(),
            info,
            transport,
            printing: Mutex::new(GcodePrintingInfo::default()),
        }
    }

    /// Stable identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Identity and link parameters
    pub fn info(&self) -> &AgentInfo {
        &self.info
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Network address, empty for serial-only machines
    pub fn address(&self) -> &str {
        &self.info.address
    }

    /// Serial port path
    pub fn port(&self) -> &str {
        &self.info.port
    }

    /// Whether the machine is reached over the network
    pub fn is_networked_machine(&self) -> bool {
        self.info.is_networked_machine()
    }

    /// Whether the user entered this machine
    pub fn added_by_user(&self) -> bool {
        self.info.added_by_user
    }

    /// Transport kind
    pub fn connection_type(&self) -> ConnectionType {
        self.transport.connection_type()
    }

    /// Whether the transport is open
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Session token of a networked machine
    pub fn token(&self) -> Option<String> {
        self.transport.token()
    }

    /// Attach or clear the session token
    pub fn set_token(&self, token: Option<String>) {
        self.transport.set_token(token);
    }

    /// Unsolicited transport traffic
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.transport.subscribe()
    }

    /// Summary published in discovery events
    pub fn summary(&self) -> MachineSummary {
        MachineSummary {
            name: self.info.name.clone(),
            address: self.info.address.clone(),
            port: self.info.port.clone(),
            model: self.info.model.clone(),
            added_by_user: self.info.added_by_user,
        }
    }

    /// Open the transport
    ///
    /// A networked machine's token is captured on success. Protocol-level
    /// refusals come back as a non-empty `msg`; transport failures as `Err`.
    pub async fn connect(&self) -> Result<ConnectResult> {
        tracing::info!(
            "Connecting to {} over {}",
            self.info.name,
            self.connection_type()
        );
        self.info.validate()?;
        self.transport.connect().await
    }

    /// Close the transport; `force` skips waiting on the remote side
    pub async fn disconnect(&self, force: bool) -> Result<()> {
        *self.printing.lock() = GcodePrintingInfo::default();
        self.transport.disconnect(force).await
    }

    /// Send G-code; resolves once the transport accepted it
    pub async fn execute_gcode(&self, gcode: &str) -> Result<()> {
        self.transport
            .send(MachineRequest::Gcode(gcode.to_string()))
            .await
    }

    /// Jog to the given axis targets
    pub async fn coordinate_move(
        &self,
        move_orders: &[MoveOrder],
        gcode: &str,
        jog_speed: f64,
        head_type: Option<HeadType>,
    ) -> Result<()> {
        self.execute_gcode(&coordinate_move_gcode(move_orders, gcode, jog_speed, head_type))
            .await
    }

    /// Make the current position the work origin
    pub async fn set_work_origin(&self, x: f64, y: f64, z: f64, b: Option<f64>) -> Result<()> {
        self.execute_gcode(&set_work_origin_gcode(x, y, z, b)).await
    }

    /// Home the given axes, or all axes when empty
    pub async fn go_home(&self, axes: &[Axis]) -> Result<()> {
        self.execute_gcode(&go_home_gcode(axes)).await
    }

    /// Start the loaded job
    pub async fn start_print(&self) -> Result<CommandResponse> {
        self.transport.request(MachineRequest::StartPrint).await
    }

    /// Pause the running job
    pub async fn pause_print(&self) -> Result<CommandResponse> {
        self.transport.request(MachineRequest::PausePrint).await
    }

    /// Resume a paused job
    pub async fn resume_print(&self) -> Result<CommandResponse> {
        self.transport.request(MachineRequest::ResumePrint).await
    }

    /// Stop the running job; `data` of the response reports partial failure
    pub async fn stop_print(&self) -> Result<CommandResponse> {
        self.transport.request(MachineRequest::StopPrint).await
    }

    /// Poll machine status
    pub async fn query_status(&self) -> Result<StatusPoll> {
        self.transport.query_status().await
    }

    /// Fold a progress report into the running job record
    pub fn get_gcode_printing_info(&self, data: &PrintProgress) -> GcodePrintingInfo {
        let mut info = self.printing.lock();
        *info = info.fold(data, Utc::now());
        info.clone()
    }

    async fn serial_request(&self, operation: &str, packet: Packet) -> Result<CommandResponse> {
        if self.is_networked_machine() {
            return Err(ControllerError::Unsupported {
                operation: operation.to_string(),
                transport: ConnectionType::WiFi.to_string(),
            }
            .into());
        }
        self.transport.request(MachineRequest::Packet(packet)).await
    }

    /// Start automatic bed calibration
    pub async fn start_auto_calibration(&self) -> Result<CommandResponse> {
        self.serial_request(
            "start_auto_calibration",
            Packet::settings(SettingsCommand::StartAutoCalibration),
        )
        .await
    }

    /// Start manual calibration, or go to calibration point `point`
    pub async fn manual_calibration(&self, point: u8) -> Result<CommandResponse> {
        self.serial_request("manual_calibration", Packet::manual_calibration(point))
            .await
    }

    /// Nudge the current calibration point along Z
    pub async fn move_calibration_point(&self, offset_mm: f64) -> Result<CommandResponse> {
        self.serial_request(
            "move_calibration_point",
            Packet::move_calibration_point(offset_mm),
        )
        .await
    }

    /// Save the calibration
    pub async fn save_calibration(&self) -> Result<CommandResponse> {
        self.serial_request("save_calibration", Packet::settings(SettingsCommand::SaveCalibration))
            .await
    }

    /// Leave calibration without saving
    pub async fn exit_calibration(&self) -> Result<CommandResponse> {
        self.serial_request("exit_calibration", Packet::settings(SettingsCommand::ExitCalibration))
            .await
    }

    /// Reset calibration to defaults
    pub async fn reset_calibration(&self) -> Result<CommandResponse> {
        self.serial_request("reset_calibration", Packet::settings(SettingsCommand::ResetCalibration))
            .await
    }

    /// Laser focal length in millimetres
    pub async fn laser_focal_length(&self) -> Result<f64> {
        let response = self
            .serial_request(
                "laser_focal_length",
                Packet::settings(SettingsCommand::LaserFocalLength),
            )
            .await?;
        let bytes = response_bytes(&response);
        decode_focal_length(&bytes).ok_or_else(|| {
            ProtocolError::UnexpectedResponse {
                reason: format!("focal length reply carried {} byte(s)", bytes.len()),
            }
            .into()
        })
    }

    /// Mount on-board storage
    pub async fn mount_storage(&self) -> Result<CommandResponse> {
        self.serial_request("mount_storage", Packet::mount_storage())
            .await
    }

    /// List files on on-board storage
    pub async fn list_files(&self, rewind: bool) -> Result<Vec<String>> {
        let response = self
            .serial_request("list_files", Packet::list_files(rewind))
            .await?;
        let text = String::from_utf8_lossy(&response_bytes(&response)).into_owned();
        Ok(text
            .split(['\n', '\0'])
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Print a file stored on the machine
    pub async fn print_file(&self, file_name: &str) -> Result<CommandResponse> {
        self.serial_request("print_file", Packet::print_file(file_name))
            .await
    }
}

impl fmt::Debug for MachineAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineAgent")
            .field("id", &self.id)
            .field("name", &self.info.name)
            .field("address", &self.info.address)
            .field("port", &self.info.port)
            .field("added_by_user", &self.info.added_by_user)
            .finish()
    }
}
