//! Networked transport over the controller's HTTP API
//!
//! The machine issues a bearer token on the first successful connect. Until
//! the user confirms the session on the touchscreen, status polls answer 204;
//! a revoked token answers 401.

use super::{
    CommandResponse, ConnectResult, MachineRequest, StatusPoll, StatusSnapshot, Transport,
    TransportEvent, EVENT_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use snapkit_core::{
    ConnectionError, ConnectionType, ControllerError, HeadType, MachineState, Position,
    ProtocolError, Result, WorkflowStatus,
};
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// Port the controller API listens on
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Status document returned by `GET /api/v1/status`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkStatus {
    /// Workflow status (`IDLE`, `RUNNING`, `PAUSED`, ...)
    pub status: String,
    /// Work position X
    pub x: f64,
    /// Work position Y
    pub y: f64,
    /// Work position Z
    pub z: f64,
    /// Rotary axis, when a rotary module is attached
    pub b: Option<f64>,
    /// Work origin offset X
    pub offset_x: f64,
    /// Work origin offset Y
    pub offset_y: f64,
    /// Work origin offset Z
    pub offset_z: f64,
    /// Homed since power-up
    pub homed: bool,
    /// Tool head identifier
    pub tool_head: String,
    /// Nozzle temperature
    pub nozzle_temperature: f64,
    /// Nozzle target temperature
    pub nozzle_target_temperature: f64,
    /// Heated bed temperature
    pub heated_bed_temperature: f64,
    /// Heated bed target temperature
    pub heated_bed_target_temperature: f64,
    /// Laser power in percent
    pub laser_power: f64,
    /// Spindle speed
    pub spindle_speed: f64,
    /// Enclosure door open
    pub is_enclosure_door_open: bool,
    /// Attached modules
    pub module_list: BTreeMap<String, bool>,
}

impl NetworkStatus {
    /// Convert into the shared snapshot shape
    pub fn to_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            workflow_status: WorkflowStatus::from_api(&self.status),
            state: MachineState {
                work_position: Position {
                    x: self.x,
                    y: self.y,
                    z: self.z,
                    b: self.b,
                },
                origin_offset: Position::new(self.offset_x, self.offset_y, self.offset_z),
                is_homed: self.homed,
                is_enclosure_door_open: self.is_enclosure_door_open,
                module_status: self.module_list.clone(),
                head_type: HeadType::from_api(&self.tool_head),
                nozzle_temperature: self.nozzle_temperature,
                nozzle_target_temperature: self.nozzle_target_temperature,
                bed_temperature: self.heated_bed_temperature,
                bed_target_temperature: self.heated_bed_target_temperature,
                laser_power: self.laser_power,
                spindle_speed: self.spindle_speed,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConnectReply {
    token: Option<String>,
}

/// Transport for a networked machine
pub struct NetworkTransport {
    host: String,
    port: u16,
    client: Client,
    timeout: Duration,
    token: RwLock<Option<String>>,
    connected: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl NetworkTransport {
    /// Create a transport with its own HTTP client
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectionError::Http {
                reason: e.to_string(),
            })?;
        Ok(Self::with_client(client, host, port, timeout))
    }

    /// Create a transport sharing an existing HTTP client
    pub fn with_client(client: Client, host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            host: host.into(),
            port,
            client,
            timeout,
            token: RwLock::new(None),
            connected: AtomicBool::new(false),
            events,
        }
    }

    /// Machine host or address
    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, endpoint: &str) -> String {
        format!("http://{}:{}/api/v1/{}", self.host, self.port, endpoint)
    }

    fn token_field(&self) -> (&'static str, String) {
        ("token", self.token.read().clone().unwrap_or_default())
    }

    /// Map a reqwest failure onto the connection error taxonomy
    fn classify(&self, err: &reqwest::Error) -> ConnectionError {
        if err.is_timeout() {
            return ConnectionError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            };
        }

        match io_error_kind(err) {
            Some(io::ErrorKind::ConnectionRefused) => ConnectionError::ConnectionRefused {
                host: self.host.clone(),
            },
            Some(io::ErrorKind::ConnectionReset) => ConnectionError::ConnectionReset {
                reason: err.to_string(),
            },
            Some(io::ErrorKind::ConnectionAborted) => ConnectionError::ConnectionAborted {
                reason: err.to_string(),
            },
            Some(io::ErrorKind::AddrNotAvailable) => ConnectionError::AddressUnavailable {
                address: self.host.clone(),
            },
            Some(io::ErrorKind::TimedOut) => ConnectionError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            },
            _ if err.is_connect() => ConnectionError::HostUnreachable {
                host: self.host.clone(),
            },
            _ => ConnectionError::Http {
                reason: err.to_string(),
            },
        }
    }

    /// Statuses that fail every endpoint the same way
    fn status_error(&self, status: StatusCode, endpoint: &str, body: &str) -> Option<ConnectionError> {
        match status {
            StatusCode::UNAUTHORIZED => Some(ConnectionError::Unauthorized),
            StatusCode::FORBIDDEN => Some(ConnectionError::Forbidden {
                reason: if body.is_empty() {
                    "version mismatch or machine occupied".to_string()
                } else {
                    body.to_string()
                },
            }),
            StatusCode::NOT_FOUND => Some(ConnectionError::NotFound {
                resource: self.url(endpoint),
            }),
            _ => None,
        }
    }

    async fn post(&self, endpoint: &str, form: &[(&str, String)]) -> Result<(StatusCode, String)> {
        let response = self
            .client
            .post(self.url(endpoint))
            .form(form)
            .send()
            .await
            .map_err(|e| self.classify(&e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.classify(&e))?;
        tracing::debug!("POST {} -> {}", endpoint, status);
        Ok((status, body))
    }

    async fn command(&self, endpoint: &str, mut form: Vec<(&str, String)>) -> Result<CommandResponse> {
        form.insert(0, self.token_field());
        let (status, body) = self.post(endpoint, &form).await?;

        if status.is_success() {
            return Ok(CommandResponse {
                code: status.as_u16(),
                msg: String::new(),
                data: serde_json::from_str(&body).ok(),
            });
        }
        if let Some(err) = self.status_error(status, endpoint, &body) {
            return Err(err.into());
        }
        Ok(CommandResponse {
            code: status.as_u16(),
            msg: if body.is_empty() {
                status.to_string()
            } else {
                body
            },
            data: None,
        })
    }
}

fn io_error_kind(err: &reqwest::Error) -> Option<io::ErrorKind> {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source = inner.source();
    }
    None
}

impl std::fmt::Debug for NetworkTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token", &self.token.read().as_ref().map(|_| "[REDACTED]"))
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl Transport for NetworkTransport {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::WiFi
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn connect(&self) -> Result<ConnectResult> {
        let saved = self.token.read().clone();
        let form: Vec<(&str, String)> = saved.iter().map(|t| ("token", t.clone())).collect();
        let (status, body) = self.post("connect", &form).await?;

        if status.is_success() {
            let token = serde_json::from_str::<ConnectReply>(&body)
                .ok()
                .and_then(|reply| reply.token)
                .or(saved);
            *self.token.write() = token.clone();
            self.connected.store(true, Ordering::Release);
            tracing::info!("Connected to {}:{}", self.host, self.port);
            return Ok(ConnectResult {
                code: status.as_u16(),
                msg: String::new(),
                token,
            });
        }

        match status {
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                let err = self
                    .status_error(status, "connect", &body)
                    .unwrap_or(ConnectionError::Http {
                        reason: status.to_string(),
                    });
                Err(err.into())
            }
            _ => {
                tracing::warn!("Connect to {} refused with {}", self.host, status);
                Ok(ConnectResult {
                    code: status.as_u16(),
                    msg: if body.is_empty() {
                        status.to_string()
                    } else {
                        body
                    },
                    token: None,
                })
            }
        }
    }

    async fn disconnect(&self, force: bool) -> Result<()> {
        if !force && self.is_connected() {
            if let Err(e) = self.post("disconnect", &[self.token_field()]).await {
                tracing::warn!("Disconnect request to {} failed: {}", self.host, e);
            }
        }

        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        *self.token.write() = None;
        if was_connected {
            let _ = self.events.send(TransportEvent::Closed {
                reason: "disconnected".to_string(),
            });
        }
        Ok(())
    }

    async fn send(&self, request: MachineRequest) -> Result<()> {
        let operation = request.operation();
        let response = self.request(request).await?;
        if response.is_ok() {
            Ok(())
        } else {
            Err(ControllerError::CommandRejected {
                reason: format!("{}: {}", operation, response.msg),
            }
            .into())
        }
    }

    async fn request(&self, request: MachineRequest) -> Result<CommandResponse> {
        let operation = request.operation();
        match request {
            MachineRequest::Gcode(gcode) => {
                self.command(
                    "execute_code",
                    vec![("code", crate::protocol::sanitize_gcode(&gcode))],
                )
                .await
            }
            MachineRequest::StartPrint => self.command("start_print", Vec::new()).await,
            MachineRequest::PausePrint => self.command("pause_print", Vec::new()).await,
            MachineRequest::ResumePrint => self.command("resume_print", Vec::new()).await,
            MachineRequest::StopPrint => self.command("stop_print", Vec::new()).await,
            MachineRequest::QueryStatus => match self.query_status().await? {
                StatusPoll::Ready(snapshot) => Ok(CommandResponse::ok().with_data(
                    serde_json::to_value(&snapshot).map_err(|e| ProtocolError::UnexpectedResponse {
                        reason: e.to_string(),
                    })?,
                )),
                StatusPoll::AwaitingAuth => Ok(CommandResponse {
                    code: StatusCode::NO_CONTENT.as_u16(),
                    msg: "awaiting confirmation on the machine".to_string(),
                    data: None,
                }),
            },
            MachineRequest::Packet(_) => Err(ControllerError::Unsupported {
                operation: operation.to_string(),
                transport: ConnectionType::WiFi.to_string(),
            }
            .into()),
        }
    }

    async fn query_status(&self) -> Result<StatusPoll> {
        let response = self
            .client
            .get(self.url("status"))
            .query(&[self.token_field()])
            .send()
            .await
            .map_err(|e| self.classify(&e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.classify(&e))?;

        match status {
            StatusCode::OK => {
                let parsed: NetworkStatus =
                    serde_json::from_str(&body).map_err(|e| ProtocolError::UnexpectedResponse {
                        reason: format!("status document: {}", e),
                    })?;
                Ok(StatusPoll::Ready(parsed.to_snapshot()))
            }
            StatusCode::NO_CONTENT => Ok(StatusPoll::AwaitingAuth),
            _ => Err(self
                .status_error(status, "status", &body)
                .unwrap_or(ConnectionError::Http {
                    reason: format!("status poll answered {}", status),
                })
                .into()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_document_to_snapshot() {
        let body = r#"{
            "status": "RUNNING",
            "x": 10.5, "y": 20.0, "z": 3.0,
            "offsetX": 1.0, "offsetY": 2.0, "offsetZ": 0.5,
            "homed": true,
            "toolHead": "TOOLHEAD_3DPRINTING_1",
            "nozzleTemperature": 205.0,
            "nozzleTargetTemperature": 210.0,
            "heatedBedTemperature": 60.0,
            "heatedBedTargetTemperature": 60.0,
            "isEnclosureDoorOpen": false,
            "moduleList": {"enclosure": true}
        }"#;
        let status: NetworkStatus = serde_json::from_str(body).unwrap();
        let snapshot = status.to_snapshot();
        assert_eq!(snapshot.workflow_status, WorkflowStatus::Running);
        assert_eq!(snapshot.state.work_position.x, 10.5);
        assert_eq!(snapshot.state.origin_offset.z, 0.5);
        assert_eq!(snapshot.state.head_type, Some(HeadType::Printing));
        assert_eq!(snapshot.state.module_status.get("enclosure"), Some(&true));
        assert!(snapshot.state.is_homed);
    }

    #[test]
    fn test_missing_fields_default() {
        let status: NetworkStatus = serde_json::from_str(r#"{"status":"IDLE"}"#).unwrap();
        assert_eq!(status.to_snapshot().workflow_status, WorkflowStatus::Idle);
        assert_eq!(status.b, None);
    }

    #[test]
    fn test_debug_redacts_token() {
        let transport =
            NetworkTransport::new("192.168.1.100", DEFAULT_HTTP_PORT, Duration::from_secs(1))
                .unwrap();
        transport.set_token(Some("secret".into()));
        let debug = format!("{:?}", transport);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("REDACTED"));
    }
}
