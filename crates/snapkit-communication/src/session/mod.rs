//! Connection session
//!
//! Coordinates the single open machine:
//!
//! ```text
//! Idle -> Connecting -> (RequireAuth) -> Connected -> Idle
//!           |
//!           +-> Idle (failure or cancellation)
//! ```
//!
//! Every transition happens under one mutex that is never held across an
//! `.await`. Each connect attempt bumps an epoch; background tasks and
//! settling connect calls re-check it, so work started for a torn-down
//! attempt cannot touch the current one.

mod heartbeat;

pub use heartbeat::HeartbeatConfig;

use crate::agent::MachineAgent;
use crate::communication::{ConnectResult, StatusSnapshot, TransportEvent};
use crate::protocol::{decode_focal_length, ParsedFrame, SettingsCommand};
use parking_lot::Mutex;
use snapkit_core::{
    AppEvent, ConnectionError, ConnectionEvent, ConnectionStatus, ConnectionType,
    DisconnectReason, EventBus, MachineEvent, MachineState, ProtocolEvent, Result,
    SavedConnection, SavedConnectionStore, WorkflowStatus,
};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Default)]
struct SessionState {
    status: ConnectionStatus,
    connection_type: ConnectionType,
    selected_agent: Option<Arc<MachineAgent>>,
    epoch: u64,
    workflow_status: WorkflowStatus,
    machine_state: MachineState,
    heartbeat: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

/// What a teardown took out of the session
struct Teardown {
    agent: Option<Arc<MachineAgent>>,
    heartbeat: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    previous: ConnectionStatus,
}

impl Teardown {
    fn abort_tasks(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
    }
}

impl SessionState {
    fn teardown(&mut self) -> Teardown {
        self.epoch += 1;
        self.workflow_status = WorkflowStatus::Unknown;
        self.machine_state = MachineState::default();
        Teardown {
            agent: self.selected_agent.take(),
            heartbeat: self.heartbeat.take(),
            listener: self.listener.take(),
            previous: std::mem::replace(&mut self.status, ConnectionStatus::Idle),
        }
    }
}

/// Single-connection coordinator
pub struct ConnectionSession {
    bus: Arc<EventBus>,
    store: Arc<dyn SavedConnectionStore>,
    heartbeat: HeartbeatConfig,
    state: Mutex<SessionState>,
    this: Weak<ConnectionSession>,
}

impl ConnectionSession {
    /// Create a session publishing on `bus` and remembering credentials in `store`
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<dyn SavedConnectionStore>,
        heartbeat: HeartbeatConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            bus,
            store,
            heartbeat,
            state: Mutex::new(SessionState::default()),
            this: this.clone(),
        })
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    /// Transport kind of the selected machine
    pub fn connection_type(&self) -> ConnectionType {
        self.state.lock().connection_type
    }

    /// Machine currently selected (connecting or open)
    pub fn selected_agent(&self) -> Option<Arc<MachineAgent>> {
        self.state.lock().selected_agent.clone()
    }

    /// Machine that is fully connected
    pub fn active_agent(&self) -> Result<Arc<MachineAgent>> {
        let state = self.state.lock();
        match (&state.status, &state.selected_agent) {
            (ConnectionStatus::Connected, Some(agent)) => Ok(agent.clone()),
            _ => Err(ConnectionError::NotConnected.into()),
        }
    }

    /// Last machine-reported workflow status
    pub fn workflow_status(&self) -> WorkflowStatus {
        self.state.lock().workflow_status
    }

    /// Live machine state
    pub fn machine_state(&self) -> MachineState {
        self.state.lock().machine_state.clone()
    }

    /// Credentials of the last successful connection
    pub fn saved_connection(&self) -> Result<SavedConnection> {
        self.store.load()
    }

    /// Event bus the session publishes on
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.state.lock().epoch == epoch
    }

    /// Open `agent`
    ///
    /// Fails with `ConnectInProgress` while another attempt is pending and
    /// with `AlreadyConnected` while a machine is open. If the session is
    /// disconnected or reset before the agent's connect settles, the attempt
    /// fails with `Cancelled` and its transport is torn down, unless a newer
    /// attempt has selected the same agent again.
    pub async fn connect(&self, agent: Arc<MachineAgent>) -> Result<ConnectResult> {
        let epoch = {
            let mut state = self.state.lock();
            match state.status {
                ConnectionStatus::Connecting => {
                    return Err(ConnectionError::ConnectInProgress.into());
                }
                ConnectionStatus::RequireAuth | ConnectionStatus::Connected => {
                    let name = state
                        .selected_agent
                        .as_ref()
                        .map(|a| a.name().to_string())
                        .unwrap_or_default();
                    return Err(ConnectionError::AlreadyConnected { name }.into());
                }
                ConnectionStatus::Idle => {}
            }
            state.epoch += 1;
            state.status = ConnectionStatus::Connecting;
            state.connection_type = agent.connection_type();
            state.selected_agent = Some(agent.clone());
            state.epoch
        };

        self.bus
            .publish(AppEvent::Connection(ConnectionEvent::Connecting {
                name: agent.name().to_string(),
                connection_type: agent.connection_type(),
            }));

        if agent.is_networked_machine() && agent.token().is_none() {
            match self.store.load() {
                Ok(saved) if saved.address == agent.address() => agent.set_token(saved.token),
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to load saved connection: {}", e),
            }
        }

        let events = agent.subscribe();
        let result = agent.connect().await;

        let networked = agent.is_networked_machine();
        // (cancelled, transport taken over by a newer attempt on the same agent)
        let (cancelled, superseded) = {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.status != ConnectionStatus::Connecting {
                let superseded = state
                    .selected_agent
                    .as_ref()
                    .is_some_and(|selected| Arc::ptr_eq(selected, &agent));
                (true, superseded)
            } else {
                match &result {
                    Ok(connected) if connected.is_ok() => {
                        state.status = if networked {
                            ConnectionStatus::RequireAuth
                        } else {
                            ConnectionStatus::Connected
                        };
                        state.listener = Some(self.spawn_listener(events, epoch));
                        if networked {
                            state.heartbeat = Some(heartbeat::spawn(
                                self.this.clone(),
                                agent.clone(),
                                epoch,
                                self.heartbeat,
                            ));
                        }
                    }
                    _ => {
                        state.status = ConnectionStatus::Idle;
                        state.selected_agent = None;
                    }
                }
                (false, false)
            }
        };

        if cancelled {
            tracing::info!("Connect to {} cancelled", agent.name());
            if superseded {
                tracing::debug!("{} reopened since, leaving its transport up", agent.name());
            } else if result.is_ok() {
                if let Err(e) = agent.disconnect(true).await {
                    tracing::debug!("Teardown of cancelled connect failed: {}", e);
                }
            }
            return Err(ConnectionError::Cancelled.into());
        }

        let connected = match result {
            Ok(connected) if connected.is_ok() => connected,
            failed => {
                let (code, error) = match &failed {
                    Ok(refused) => (refused.code.to_string(), refused.msg.clone()),
                    Err(e) => (e.code().unwrap_or("EUNKNOWN").to_string(), e.to_string()),
                };
                tracing::warn!("Connect to {} failed [{}]: {}", agent.name(), code, error);
                self.bus
                    .publish(AppEvent::Connection(ConnectionEvent::ConnectionFailed {
                        name: agent.name().to_string(),
                        code,
                        error,
                    }));
                return failed;
            }
        };

        let saved = SavedConnection {
            connection_type: agent.connection_type(),
            name: agent.name().to_string(),
            address: agent.address().to_string(),
            port: agent.port().to_string(),
            token: connected.token.clone().or_else(|| agent.token()),
        };
        if let Err(e) = self.store.save(&saved) {
            tracing::warn!("Failed to save connection credentials: {}", e);
        }

        let event = if networked {
            ConnectionEvent::RequireAuth {
                name: agent.name().to_string(),
            }
        } else {
            connected_event(&agent)
        };
        self.bus.publish(AppEvent::Connection(event));
        tracing::info!("Opened {} over {}", agent.name(), agent.connection_type());

        Ok(connected)
    }

    /// Close `agent`; the session always ends up idle
    ///
    /// Saved credentials are kept; live machine state is reset.
    pub async fn disconnect(&self, agent: &Arc<MachineAgent>, force: bool) -> Result<()> {
        let mut teardown = {
            let mut state = self.state.lock();
            if let Some(selected) = &state.selected_agent {
                if !Arc::ptr_eq(selected, agent) {
                    return Err(ConnectionError::NotConnected.into());
                }
            }
            state.teardown()
        };
        teardown.abort_tasks();

        let result = agent.disconnect(force).await;
        if teardown.previous != ConnectionStatus::Idle {
            tracing::info!("Disconnected from {}", agent.name());
            self.publish_closed(agent, DisconnectReason::UserRequested);
        }
        result
    }

    /// Tear down whatever is open or pending, at process start or reload
    pub async fn reset_connections(&self, force: bool) {
        let mut teardown = self.state.lock().teardown();
        teardown.abort_tasks();

        if let Some(agent) = teardown.agent {
            if let Err(e) = agent.disconnect(force).await {
                tracing::warn!("Reset of {} failed: {}", agent.name(), e);
            }
            if teardown.previous != ConnectionStatus::Idle {
                self.publish_closed(&agent, DisconnectReason::Reset);
            }
        }
    }

    pub(crate) fn apply_status(&self, epoch: u64, snapshot: StatusSnapshot) {
        let promoted = {
            let mut state = self.state.lock();
            if state.epoch != epoch || !state.status.is_open() {
                return;
            }
            state.workflow_status = snapshot.workflow_status;
            state.machine_state = snapshot.state.clone();
            if state.status == ConnectionStatus::RequireAuth {
                state.status = ConnectionStatus::Connected;
                state.selected_agent.clone()
            } else {
                None
            }
        };

        if let Some(agent) = promoted {
            tracing::info!("{} confirmed the session", agent.name());
            self.bus
                .publish(AppEvent::Connection(connected_event(&agent)));
        }
        self.bus.publish(AppEvent::Machine(MachineEvent::State {
            workflow_status: snapshot.workflow_status,
            state: snapshot.state,
        }));
    }

    pub(crate) fn await_auth(&self, epoch: u64) {
        let demoted = {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.status != ConnectionStatus::Connected {
                return;
            }
            state.status = ConnectionStatus::RequireAuth;
            state.selected_agent.clone()
        };
        if let Some(agent) = demoted {
            self.bus
                .publish(AppEvent::Connection(ConnectionEvent::RequireAuth {
                    name: agent.name().to_string(),
                }));
        }
    }

    pub(crate) async fn close_unauthorized(&self, epoch: u64, agent: &Arc<MachineAgent>) {
        let mut teardown = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.teardown()
        };
        // Called from the heartbeat task itself; detach rather than abort it.
        teardown.heartbeat.take();
        teardown.abort_tasks();

        if let Err(e) = agent.disconnect(true).await {
            tracing::debug!("Teardown after revoked token failed: {}", e);
        }
        self.publish_closed(agent, DisconnectReason::Unauthorized);
    }

    fn connection_lost(&self, epoch: u64, reason: &str) {
        let mut teardown = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.teardown()
        };
        // Called from the listener task itself; detach rather than abort it.
        teardown.listener.take();
        teardown.abort_tasks();

        if let Some(agent) = teardown.agent {
            tracing::warn!("Lost connection to {}: {}", agent.name(), reason);
            self.publish_closed(&agent, DisconnectReason::ConnectionLost);
        }
    }

    fn spawn_listener(
        &self,
        mut events: broadcast::Receiver<TransportEvent>,
        epoch: u64,
    ) -> JoinHandle<()> {
        let session = self.this.clone();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Session listener lagged, {} event(s) skipped", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let Some(live) = session.upgrade() else {
                    break;
                };
                if !live.is_current(epoch) {
                    break;
                }

                match event {
                    TransportEvent::Status(snapshot) => live.apply_status(epoch, snapshot),
                    TransportEvent::FrameDropped { total_dropped } => {
                        live.bus
                            .publish(AppEvent::Protocol(ProtocolEvent::FrameDropped {
                                total_dropped,
                            }));
                    }
                    TransportEvent::Frame(frame) => match settings_event(&frame) {
                        Some(event) => {
                            live.bus.publish(AppEvent::Machine(event));
                        }
                        None => {
                            tracing::debug!("Unsolicited frame, event {:#04x}", frame.event_id)
                        }
                    },
                    TransportEvent::Closed { reason } => {
                        live.connection_lost(epoch, &reason);
                        break;
                    }
                }
            }
        })
    }

    fn publish_closed(&self, agent: &MachineAgent, reason: DisconnectReason) {
        self.bus
            .publish(AppEvent::Connection(ConnectionEvent::Closed {
                name: agent.name().to_string(),
                reason,
            }));
    }
}

/// Settings value carried by an unsolicited settings response
fn settings_event(frame: &ParsedFrame) -> Option<MachineEvent> {
    let (command, value) = frame.settings_report()?;
    let value = match command {
        SettingsCommand::LaserFocalLength => serde_json::Value::from(decode_focal_length(value)?),
        _ => serde_json::json!(value),
    };
    Some(MachineEvent::Settings {
        setting: command.setting_name().to_string(),
        value,
    })
}

fn connected_event(agent: &MachineAgent) -> ConnectionEvent {
    let address = if agent.is_networked_machine() {
        agent.address()
    } else {
        agent.port()
    };
    ConnectionEvent::Connected {
        name: agent.name().to_string(),
        address: address.to_string(),
        connection_type: agent.connection_type(),
    }
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionSession")
            .field("status", &state.status)
            .field("connection_type", &state.connection_type)
            .field("selected_agent", &state.selected_agent)
            .field("epoch", &state.epoch)
            .finish()
    }
}
