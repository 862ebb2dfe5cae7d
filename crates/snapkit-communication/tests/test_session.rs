use async_trait::async_trait;
use snapkit_communication::protocol::parse_frame;
use snapkit_communication::{
    AgentInfo, CommandResponse, ConnectResult, ConnectionSession, HeartbeatConfig, MachineAgent,
    MachineRequest, StatusPoll, StatusSnapshot, Transport, TransportEvent,
};
use snapkit_core::{
    AppEvent, ConnectionError, ConnectionEvent, ConnectionStatus, ConnectionType,
    DisconnectReason, Error, EventBus, MachineEvent, MemoryConnectionStore, Result,
    SavedConnection, SavedConnectionStore, WorkflowStatus,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

struct MockTransport {
    kind: ConnectionType,
    connect_delay: Duration,
    scheduled_delays: Mutex<VecDeque<Duration>>,
    connect_error: Option<ConnectionError>,
    connected: AtomicBool,
    token: Mutex<Option<String>>,
    token_seen_on_connect: Mutex<Option<String>>,
    polls: Mutex<VecDeque<Result<StatusPoll>>>,
    disconnects: AtomicUsize,
    events: broadcast::Sender<TransportEvent>,
}

impl MockTransport {
    fn new(kind: ConnectionType) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            kind,
            connect_delay: Duration::ZERO,
            scheduled_delays: Mutex::new(VecDeque::new()),
            connect_error: None,
            connected: AtomicBool::new(false),
            token: Mutex::new(None),
            token_seen_on_connect: Mutex::new(None),
            polls: Mutex::new(VecDeque::new()),
            disconnects: AtomicUsize::new(0),
            events,
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Per-call connect delays, used before falling back to `connect_delay`
    fn delays(self, delays: &[Duration]) -> Self {
        self.scheduled_delays.lock().unwrap().extend(delays);
        self
    }

    fn failing(mut self, error: ConnectionError) -> Self {
        self.connect_error = Some(error);
        self
    }

    fn queue_poll(&self, poll: Result<StatusPoll>) {
        self.polls.lock().unwrap().push_back(poll);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn connection_type(&self) -> ConnectionType {
        self.kind
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<ConnectResult> {
        let delay = self
            .scheduled_delays
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.connect_delay);
        tokio::time::sleep(delay).await;
        if let Some(error) = &self.connect_error {
            return Err(error.clone().into());
        }
        *self.token_seen_on_connect.lock().unwrap() = self.token.lock().unwrap().clone();
        self.connected.store(true, Ordering::SeqCst);
        let token = (self.kind == ConnectionType::WiFi).then(|| "issued".to_string());
        *self.token.lock().unwrap() = token.clone();
        Ok(ConnectResult {
            code: 200,
            msg: String::new(),
            token,
        })
    }

    async fn disconnect(&self, _force: bool) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, _request: MachineRequest) -> Result<()> {
        Ok(())
    }

    async fn request(&self, _request: MachineRequest) -> Result<CommandResponse> {
        Ok(CommandResponse::ok())
    }

    async fn query_status(&self) -> Result<StatusPoll> {
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(StatusPoll::Ready(StatusSnapshot {
                    workflow_status: WorkflowStatus::Running,
                    ..Default::default()
                }))
            })
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.lock().unwrap() = token;
    }
}

fn fast_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        initial_delay: Duration::from_millis(10),
        interval: Duration::from_millis(10),
    }
}

fn session_with(
    store: Arc<dyn SavedConnectionStore>,
) -> (Arc<ConnectionSession>, broadcast::Receiver<AppEvent>) {
    let bus = Arc::new(EventBus::new());
    let rx = bus.receiver();
    (ConnectionSession::new(bus, store, fast_heartbeat()), rx)
}

fn serial_agent(port: &str) -> (Arc<MachineAgent>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new(ConnectionType::Serial));
    agent_with(AgentInfo::serial(port), transport)
}

fn agent_with(
    info: AgentInfo,
    transport: Arc<MockTransport>,
) -> (Arc<MachineAgent>, Arc<MockTransport>) {
    let agent = Arc::new(MachineAgent::with_transport(info, transport.clone()));
    (agent, transport)
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<AppEvent>, mut pred: F) -> AppEvent
where
    F: FnMut(&AppEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.expect("bus closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not published")
}

fn is_closed(event: &AppEvent, expected: DisconnectReason) -> bool {
    matches!(event, AppEvent::Connection(ConnectionEvent::Closed { reason, .. }) if *reason == expected)
}

#[tokio::test]
async fn test_serial_connect_and_disconnect() {
    let store = Arc::new(MemoryConnectionStore::new());
    let (session, mut rx) = session_with(store.clone());
    let (agent, transport) = serial_agent("/dev/ttyACM0");

    let result = session.connect(agent.clone()).await.unwrap();
    assert!(result.is_ok());
    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert_eq!(session.connection_type(), ConnectionType::Serial);
    assert!(Arc::ptr_eq(&session.active_agent().unwrap(), &agent));

    assert_eq!(rx.recv().await.unwrap().name(), "connection:connecting");
    match rx.recv().await.unwrap() {
        AppEvent::Connection(ConnectionEvent::Connected { address, .. }) => {
            assert_eq!(address, "/dev/ttyACM0")
        }
        other => panic!("expected connected, got {:?}", other),
    }

    let saved = store.load().unwrap();
    assert_eq!(saved.port, "/dev/ttyACM0");
    assert_eq!(saved.connection_type, ConnectionType::Serial);

    session.disconnect(&agent, false).await.unwrap();
    assert_eq!(session.status(), ConnectionStatus::Idle);
    assert!(session.selected_agent().is_none());
    assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    wait_for(&mut rx, |e| is_closed(e, DisconnectReason::UserRequested)).await;

    // credentials survive a disconnect
    assert_eq!(session.saved_connection().unwrap().port, "/dev/ttyACM0");
}

#[tokio::test]
async fn test_only_one_machine_at_a_time() {
    let (session, _rx) = session_with(Arc::new(MemoryConnectionStore::new()));
    let (first, _) = serial_agent("/dev/ttyACM0");
    let (second, _) = serial_agent("/dev/ttyACM1");

    session.connect(first.clone()).await.unwrap();
    let err = session.connect(second.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Connection(ConnectionError::AlreadyConnected { ref name }) if name == "/dev/ttyACM0"
    ));

    let err = session.disconnect(&second, false).await.unwrap_err();
    assert!(matches!(err, Error::Connection(ConnectionError::NotConnected)));
    assert_eq!(session.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_connect_while_connecting_is_rejected() {
    let (session, _rx) = session_with(Arc::new(MemoryConnectionStore::new()));
    let slow = Arc::new(MockTransport::new(ConnectionType::Serial).slow(Duration::from_millis(200)));
    let (agent, _) = agent_with(AgentInfo::serial("/dev/ttyACM0"), slow);
    let (other, _) = serial_agent("/dev/ttyACM1");

    let pending = tokio::spawn({
        let session = session.clone();
        let agent = agent.clone();
        async move { session.connect(agent).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.status(), ConnectionStatus::Connecting);

    let err = session.connect(other).await.unwrap_err();
    assert!(matches!(err, Error::Connection(ConnectionError::ConnectInProgress)));

    assert!(pending.await.unwrap().is_ok());
    assert_eq!(session.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_disconnect_cancels_pending_connect() {
    let (session, mut rx) = session_with(Arc::new(MemoryConnectionStore::new()));
    let slow = Arc::new(MockTransport::new(ConnectionType::Serial).slow(Duration::from_millis(150)));
    let (agent, transport) = agent_with(AgentInfo::serial("/dev/ttyACM0"), slow);

    let pending = tokio::spawn({
        let session = session.clone();
        let agent = agent.clone();
        async move { session.connect(agent).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    session.disconnect(&agent, true).await.unwrap();
    assert_eq!(session.status(), ConnectionStatus::Idle);

    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(session.status(), ConnectionStatus::Idle);
    assert!(session.selected_agent().is_none());
    // once by the user, once to tear down the late-settling transport
    assert_eq!(transport.disconnects.load(Ordering::SeqCst), 2);
    assert!(!transport.is_connected());
    wait_for(&mut rx, |e| is_closed(e, DisconnectReason::UserRequested)).await;
}

#[tokio::test]
async fn test_late_cancelled_connect_leaves_reconnected_agent_open() {
    let (session, _rx) = session_with(Arc::new(MemoryConnectionStore::new()));
    let transport = Arc::new(
        MockTransport::new(ConnectionType::Serial)
            .delays(&[Duration::from_millis(200), Duration::from_millis(20)]),
    );
    let (agent, transport) = agent_with(AgentInfo::serial("/dev/ttyACM0"), transport);

    let stale = tokio::spawn({
        let session = session.clone();
        let agent = agent.clone();
        async move { session.connect(agent).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    session.disconnect(&agent, true).await.unwrap();

    assert!(session.connect(agent.clone()).await.unwrap().is_ok());
    assert_eq!(session.status(), ConnectionStatus::Connected);

    let err = stale.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());

    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert!(Arc::ptr_eq(&session.active_agent().unwrap(), &agent));
    assert!(transport.is_connected());
    assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_connect_publishes_failure() {
    let (session, mut rx) = session_with(Arc::new(MemoryConnectionStore::new()));
    let failing = Arc::new(MockTransport::new(ConnectionType::Serial).failing(
        ConnectionError::PortNotFound {
            port: "/dev/ttyACM0".into(),
        },
    ));
    let (agent, _) = agent_with(AgentInfo::serial("/dev/ttyACM0"), failing);

    let err = session.connect(agent).await.unwrap_err();
    assert_eq!(err.code(), Some("ENOENT"));
    assert_eq!(session.status(), ConnectionStatus::Idle);

    match wait_for(&mut rx, |e| e.name() == "connection:failed").await {
        AppEvent::Connection(ConnectionEvent::ConnectionFailed { code, .. }) => {
            assert_eq!(code, "ENOENT")
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_networked_connect_waits_for_confirmation() {
    let (session, mut rx) = session_with(Arc::new(MemoryConnectionStore::new()));
    let transport = Arc::new(MockTransport::new(ConnectionType::WiFi));
    transport.queue_poll(Ok(StatusPoll::AwaitingAuth));
    transport.queue_poll(Ok(StatusPoll::Ready(StatusSnapshot {
        workflow_status: WorkflowStatus::Running,
        ..Default::default()
    })));
    let (agent, _) = agent_with(AgentInfo::network("A350", "10.0.0.5"), transport);

    session.connect(agent).await.unwrap();
    assert_eq!(session.status(), ConnectionStatus::RequireAuth);
    assert!(session.active_agent().is_err());

    wait_for(&mut rx, |e| e.name() == "connection:require-auth").await;
    wait_for(&mut rx, |e| e.name() == "connection:connected").await;
    match wait_for(&mut rx, |e| e.name() == "Marlin:state").await {
        AppEvent::Machine(MachineEvent::State { workflow_status, .. }) => {
            assert_eq!(workflow_status, WorkflowStatus::Running)
        }
        other => panic!("expected state, got {:?}", other),
    }
    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert_eq!(session.workflow_status(), WorkflowStatus::Running);
}

#[tokio::test]
async fn test_revoked_token_closes_session() {
    let (session, mut rx) = session_with(Arc::new(MemoryConnectionStore::new()));
    let transport = Arc::new(MockTransport::new(ConnectionType::WiFi));
    transport.queue_poll(Err(ConnectionError::Unauthorized.into()));
    let (agent, transport) = agent_with(AgentInfo::network("A350", "10.0.0.5"), transport);

    session.connect(agent).await.unwrap();
    wait_for(&mut rx, |e| is_closed(e, DisconnectReason::Unauthorized)).await;

    assert_eq!(session.status(), ConnectionStatus::Idle);
    assert!(!transport.is_connected());
    assert_eq!(session.workflow_status(), WorkflowStatus::Unknown);
}

fn remembered_a350() -> Arc<MemoryConnectionStore> {
    Arc::new(MemoryConnectionStore::with_saved(SavedConnection {
        connection_type: ConnectionType::WiFi,
        name: "A350".into(),
        address: "10.0.0.5".into(),
        port: String::new(),
        token: Some("remembered".into()),
    }))
}

#[tokio::test]
async fn test_saved_token_is_offered_to_the_same_machine() {
    let store = remembered_a350();
    let (session, _rx) = session_with(store.clone());
    let (agent, transport) = agent_with(
        AgentInfo::network("A350", "10.0.0.5"),
        Arc::new(MockTransport::new(ConnectionType::WiFi)),
    );

    session.connect(agent).await.unwrap();
    assert_eq!(
        transport.token_seen_on_connect.lock().unwrap().as_deref(),
        Some("remembered")
    );
    assert_eq!(store.load().unwrap().token.as_deref(), Some("issued"));
}

#[tokio::test]
async fn test_saved_token_is_not_offered_to_other_machines() {
    let (session, _rx) = session_with(remembered_a350());
    let (agent, transport) = agent_with(
        AgentInfo::network("J1", "10.0.0.6"),
        Arc::new(MockTransport::new(ConnectionType::WiFi)),
    );

    session.connect(agent).await.unwrap();
    assert_eq!(*transport.token_seen_on_connect.lock().unwrap(), None);
}

#[tokio::test]
async fn test_transport_loss_and_status_reports() {
    let (session, mut rx) = session_with(Arc::new(MemoryConnectionStore::new()));
    let (agent, transport) = serial_agent("/dev/ttyACM0");
    session.connect(agent).await.unwrap();

    transport
        .events
        .send(TransportEvent::Status(StatusSnapshot {
            workflow_status: WorkflowStatus::Paused,
            ..Default::default()
        }))
        .unwrap();
    wait_for(&mut rx, |e| e.name() == "Marlin:state").await;
    assert_eq!(session.workflow_status(), WorkflowStatus::Paused);

    transport
        .events
        .send(TransportEvent::FrameDropped { total_dropped: 3 })
        .unwrap();
    wait_for(&mut rx, |e| e.name() == "protocol:frame-dropped").await;

    let focal_length = parse_frame(&[0x0a, 0x0a, 0x00, 0x00, 0x27, 0x10]).unwrap();
    transport
        .events
        .send(TransportEvent::Frame(focal_length))
        .unwrap();
    match wait_for(&mut rx, |e| e.name() == "Marlin:settings").await {
        AppEvent::Machine(MachineEvent::Settings { setting, value }) => {
            assert_eq!(setting, "laserFocalLength");
            assert_eq!(value, serde_json::json!(10.0));
        }
        other => panic!("expected settings, got {:?}", other),
    }

    transport
        .events
        .send(TransportEvent::Closed {
            reason: "unplugged".into(),
        })
        .unwrap();
    wait_for(&mut rx, |e| is_closed(e, DisconnectReason::ConnectionLost)).await;
    assert_eq!(session.status(), ConnectionStatus::Idle);
}

#[tokio::test]
async fn test_reset_connections() {
    let (session, mut rx) = session_with(Arc::new(MemoryConnectionStore::new()));
    let (agent, transport) = serial_agent("/dev/ttyACM0");
    session.connect(agent).await.unwrap();

    session.reset_connections(true).await;
    assert_eq!(session.status(), ConnectionStatus::Idle);
    assert!(!transport.is_connected());
    wait_for(&mut rx, |e| is_closed(e, DisconnectReason::Reset)).await;

    // nothing open: reset is a no-op
    session.reset_connections(false).await;
    assert_eq!(session.status(), ConnectionStatus::Idle);
}
