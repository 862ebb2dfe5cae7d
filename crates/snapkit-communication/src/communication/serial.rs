//! Serial port transport
//!
//! Framed packet protocol over a USB / RS-232 link.
//!
//! Supports:
//! - Port enumeration filtered to controller-like device names
//! - Opening at a configured baud rate (8N1, no flow control)
//! - An IO loop feeding received bytes through the frame reassembler
//! - Request / response correlation through the pending request table

use super::pending::PendingRequests;
use super::{
    CommandResponse, ConnectResult, MachineRequest, StatusPoll, StatusSnapshot, Transport,
    TransportEvent, EVENT_CHANNEL_CAPACITY,
};
use crate::protocol::{EventId, FrameReassembler, Packet, ParsedFrame, StatusRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use snapkit_core::{
    ConnectionError, ConnectionType, ControllerError, Error, MachineState, ProtocolVersion,
    Result,
};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Baud rate spoken by the machine firmware
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Port read timeout; keeps the IO loop responsive to writes and shutdown
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Idle delay between reads that returned nothing
const LOOP_DELAY: Duration = Duration::from_millis(5);

const READ_CHUNK: usize = 1024;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            vid: None,
            pid: None,
        }
    }

    /// Set manufacturer
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }
}

/// List serial ports a machine may be attached to
///
/// Only device names matching machine-controller patterns are returned:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        Error::other(format!("Failed to enumerate ports: {}", e))
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_machine_port(&port.port_name))
        .map(|port| {
            let info = SerialPortInfo::new(&port.port_name, port_description(port));
            match &port.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    let info = info.with_usb_ids(usb.vid, usb.pid);
                    match &usb.manufacturer {
                        Some(mfg) => info.with_manufacturer(mfg),
                        None => info,
                    }
                }
                _ => info,
            }
        })
        .collect())
}

/// Check if a port name matches a machine-controller pattern
pub fn is_machine_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial-")
        || port_name.starts_with("/dev/cu.usbmodem")
}

fn port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb) => format!(
            "USB {} {}",
            usb.manufacturer.as_deref().unwrap_or("Device"),
            usb.product.as_deref().unwrap_or("Serial Port")
        ),
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Byte-level serial link
///
/// `read` returns `ErrorKind::TimedOut` (or `WouldBlock`) when no data is
/// waiting; any other error is treated as link loss.
pub trait SerialLink: Send {
    /// Write all bytes
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read whatever is available into `buf`
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens a link for a port path and baud rate
pub type LinkFactory = Arc<dyn Fn(&str, u32) -> Result<Box<dyn SerialLink>> + Send + Sync>;

/// Serial port opened through the `serialport` crate
pub struct RealSerialLink {
    port: Box<dyn serialport::SerialPort>,
}

impl RealSerialLink {
    /// Open `port` at `baud_rate`, 8N1 without flow control
    pub fn open(port: &str, baud_rate: u32) -> Result<Self> {
        let builder = serialport::new(port, baud_rate)
            .timeout(READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None);

        match builder.open() {
            Ok(opened) => Ok(Self { port: opened }),
            Err(e) => {
                tracing::warn!("Failed to open serial port {}: {}", port, e);
                let err = match e.kind() {
                    serialport::ErrorKind::NoDevice
                    | serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
                        ConnectionError::PortNotFound {
                            port: port.to_string(),
                        }
                    }
                    _ => ConnectionError::FailedToOpen {
                        port: port.to_string(),
                        reason: e.to_string(),
                    },
                };
                Err(err.into())
            }
        }
    }

    /// Factory opening real ports
    pub fn factory() -> LinkFactory {
        Arc::new(|port: &str, baud_rate: u32| {
            RealSerialLink::open(port, baud_rate).map(|link| Box::new(link) as Box<dyn SerialLink>)
        })
    }
}

impl SerialLink for RealSerialLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

type SharedLink = Arc<Mutex<Option<Box<dyn SerialLink>>>>;

/// Transport speaking the framed protocol over a serial link
pub struct SerialTransport {
    port: String,
    baud_rate: u32,
    protocol: ProtocolVersion,
    request_timeout: Duration,
    open_link: LinkFactory,
    link: SharedLink,
    pending: Arc<PendingRequests>,
    events: broadcast::Sender<TransportEvent>,
    io_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_signal: Mutex<Option<mpsc::Sender<()>>>,
    // One open at a time; a disconnect bumps the generation so an open
    // already in flight is discarded when it lands.
    opening: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl SerialTransport {
    /// Transport for a real port
    pub fn new(
        port: impl Into<String>,
        baud_rate: u32,
        protocol: ProtocolVersion,
        request_timeout: Duration,
    ) -> Self {
        Self::with_link_factory(
            port,
            baud_rate,
            protocol,
            request_timeout,
            RealSerialLink::factory(),
        )
    }

    /// Transport opening its link through `open_link`
    pub fn with_link_factory(
        port: impl Into<String>,
        baud_rate: u32,
        protocol: ProtocolVersion,
        request_timeout: Duration,
        open_link: LinkFactory,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            port: port.into(),
            baud_rate,
            protocol,
            request_timeout,
            open_link,
            link: Arc::new(Mutex::new(None)),
            pending: Arc::new(PendingRequests::new()),
            events,
            io_task: Mutex::new(None),
            shutdown_signal: Mutex::new(None),
            opening: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Port path
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Frame layout used for outbound requests
    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Requests still waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn start_io_loop(&self) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_signal.lock() = Some(shutdown_tx);

        let link = self.link.clone();
        let pending = self.pending.clone();
        let events = self.events.clone();
        let port = self.port.clone();

        let handle = tokio::spawn(async move {
            let mut reassembler = FrameReassembler::new();
            let mut buf = [0u8; READ_CHUNK];

            loop {
                match shutdown_rx.try_recv() {
                    Err(mpsc::error::TryRecvError::Empty) => {}
                    _ => break,
                }

                let read = {
                    let mut guard = link.lock();
                    match guard.as_mut() {
                        Some(link) => link.read(&mut buf),
                        None => break,
                    }
                };

                match read {
                    Ok(n) if n > 0 => {
                        dispatch(&mut reassembler, &buf[..n], &pending, &events);
                    }
                    Ok(_) => tokio::time::sleep(LOOP_DELAY).await,
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::TimedOut
                                | io::ErrorKind::WouldBlock
                                | io::ErrorKind::Interrupted
                        ) =>
                    {
                        tokio::time::sleep(LOOP_DELAY).await
                    }
                    Err(e) => {
                        tracing::warn!("Serial link {} lost: {}", port, e);
                        link.lock().take();
                        pending.clear();
                        let _ = events.send(TransportEvent::Closed {
                            reason: e.to_string(),
                        });
                        break;
                    }
                }

                pending.evict_expired(Instant::now());
            }

            if let Some(rest) = reassembler.flush() {
                tracing::debug!("Discarding {} unframed byte(s) from {}", rest.len(), port);
            }
        });

        if let Some(previous) = self.io_task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn write(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.link.lock();
        let link = guard.as_mut().ok_or(ConnectionError::NotConnected)?;
        link.write_all(frame)
            .map_err(|e| ConnectionError::ConnectionReset {
                reason: e.to_string(),
            })?;
        tracing::debug!("TX {} byte frame on {}", frame.len(), self.port);
        Ok(())
    }

    async fn exchange(&self, packet: Packet) -> Result<ParsedFrame> {
        // The table deadline is a backstop for waiters dropped before their own timeout fires.
        let (id, rx) = self
            .pending
            .register(packet.response_key(), self.request_timeout * 2);

        let sent = packet
            .encode(self.protocol, id)
            .map_err(Error::from)
            .and_then(|frame| self.write(&frame));
        if let Err(e) = sent {
            self.pending.remove(id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(ControllerError::Abandoned { request_id: id }.into()),
            Err(_) => {
                self.pending.remove(id);
                Err(ControllerError::Timeout {
                    timeout_ms: self.request_timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.io_task.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.port)
            .field("baud_rate", &self.baud_rate)
            .field("protocol", &self.protocol)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Snapshot carried by a serial status report
pub fn snapshot_from_record(record: &StatusRecord) -> StatusSnapshot {
    let mut state = MachineState::default();
    record.apply_to(&mut state);
    StatusSnapshot {
        workflow_status: record.workflow_status(),
        state,
    }
}

fn dispatch(
    reassembler: &mut FrameReassembler,
    chunk: &[u8],
    pending: &PendingRequests,
    events: &broadcast::Sender<TransportEvent>,
) {
    let dropped_before = reassembler.stats().frames_dropped;

    for payload in reassembler.feed(chunk) {
        let frame = match payload.parse() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Skipping unparseable payload: {}", e);
                continue;
            }
        };
        tracing::debug!(
            "RX event {:#04x} ({} content bytes)",
            frame.event_id,
            frame.content.len()
        );

        if frame.is_status_report() {
            if let Some(record) = &frame.status {
                let _ = events.send(TransportEvent::Status(snapshot_from_record(record)));
            }
        }

        let resolved = match payload.sequence_index() {
            Some(index) => pending.resolve_id(index, frame),
            None => pending.resolve_oldest(frame),
        };
        if let Err(frame) = resolved {
            let _ = events.send(TransportEvent::Frame(frame));
        }
    }

    let dropped = reassembler.stats().frames_dropped;
    if dropped > dropped_before {
        let _ = events.send(TransportEvent::FrameDropped {
            total_dropped: dropped,
        });
    }
}

fn response_from_frame(frame: &ParsedFrame, multiplexed: bool) -> CommandResponse {
    let body = if multiplexed {
        frame.content.get(1..).unwrap_or(&[])
    } else {
        &frame.content[..]
    };

    let response = CommandResponse::ok();
    if body.is_empty() {
        response
    } else if frame.event_id == EventId::GcodeResponse.as_u8() {
        response.with_data(serde_json::Value::String(
            String::from_utf8_lossy(body).into_owned(),
        ))
    } else {
        response.with_data(serde_json::json!(body))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Serial
    }

    fn is_connected(&self) -> bool {
        self.link.lock().is_some()
    }

    async fn connect(&self) -> Result<ConnectResult> {
        let _opening = self.opening.lock().await;
        if self.is_connected() {
            return Ok(ConnectResult::ok());
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let open_link = self.open_link.clone();
        let port = self.port.clone();
        let baud_rate = self.baud_rate;
        let opened = tokio::task::spawn_blocking(move || open_link(&port, baud_rate))
            .await
            .map_err(|e| Error::other(format!("Serial open task failed: {}", e)))??;

        {
            let mut link = self.link.lock();
            if self.generation.load(Ordering::SeqCst) != generation {
                tracing::info!("Serial port {} closed while opening, discarding", self.port);
                return Err(ConnectionError::Cancelled.into());
            }
            *link = Some(opened);
        }
        self.start_io_loop();

        tracing::info!("Opened serial port {} at {} baud", self.port, self.baud_rate);
        Ok(ConnectResult::ok())
    }

    async fn disconnect(&self, force: bool) -> Result<()> {
        {
            let _link = self.link.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(tx) = self.shutdown_signal.lock().take() {
            let _ = tx.try_send(());
        }

        let handle = self.io_task.lock().take();
        if let Some(handle) = handle {
            if force {
                handle.abort();
            } else {
                let _ = handle.await;
            }
        }

        let had_link = self.link.lock().take().is_some();
        let abandoned = self.pending.clear();
        if had_link {
            tracing::info!(
                "Closed serial port {} ({} pending request(s) abandoned)",
                self.port,
                abandoned
            );
            let _ = self.events.send(TransportEvent::Closed {
                reason: "disconnected".to_string(),
            });
        }
        Ok(())
    }

    async fn send(&self, request: MachineRequest) -> Result<()> {
        let frame = request
            .to_packet()
            .encode(self.protocol, self.pending.next_id())?;
        self.write(&frame)
    }

    async fn request(&self, request: MachineRequest) -> Result<CommandResponse> {
        let packet = request.to_packet();
        let multiplexed = packet.is_multiplexed();
        let frame = self.exchange(packet).await?;
        Ok(response_from_frame(&frame, multiplexed))
    }

    async fn query_status(&self) -> Result<StatusPoll> {
        let frame = self.exchange(Packet::query_status()).await?;
        let record = frame.status.unwrap_or_default();
        Ok(StatusPoll::Ready(snapshot_from_record(&record)))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
