//! Machine discovery
//!
//! Scans for serial ports and networked machines and reconciles each result
//! against the agents already known for that transport:
//! - a newly seen machine gets a new agent
//! - a machine that disappeared is dropped unless the user added it
//! - a machine seen again keeps its existing agent (same `Arc`)
//!
//! The updated list is published only when membership changed.

pub mod udp;

pub use udp::{parse_reply, scan_network, DiscoveredMachine, DEFAULT_BROADCAST_PORT, DISCOVER_MESSAGE};

use crate::agent::{AgentInfo, MachineAgent, TransportOptions};
use crate::communication::{list_ports, DEFAULT_BAUD_RATE};
use parking_lot::Mutex;
use snapkit_core::{
    AppEvent, ConnectionError, DiscoveryEvent, Error, EventBus, ProtocolVersion, Result,
};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Which agent list a scan feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanKind {
    /// UDP broadcast scan
    Network,
    /// Serial port enumeration
    Serial,
}

/// Discovery parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Scanning flag resets after this long without a completion
    pub scan_timeout: Duration,
    /// Where discovery datagrams are sent
    pub broadcast_address: Ipv4Addr,
    /// Discovery port
    pub broadcast_port: u16,
    /// How long to collect replies
    pub listen_window: Duration,
    /// Baud rate of agents created for serial ports
    pub baud_rate: u32,
    /// Frame layout of agents created for serial ports
    pub protocol: ProtocolVersion,
    /// Transport parameters of created agents
    pub transport: TransportOptions,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_millis(3000),
            broadcast_address: Ipv4Addr::BROADCAST,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            listen_window: Duration::from_millis(1000),
            baud_rate: DEFAULT_BAUD_RATE,
            protocol: ProtocolVersion::default(),
            transport: TransportOptions::default(),
        }
    }
}

impl DiscoveryConfig {
    /// Target of discovery datagrams
    pub fn broadcast_target(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.broadcast_address, self.broadcast_port))
    }
}

/// Outcome of reconciling a scan against known agents
#[derive(Debug)]
pub struct Reconciled {
    /// Agents after the scan
    pub agents: Vec<Arc<MachineAgent>>,
    /// Whether membership changed
    pub changed: bool,
}

fn same_machine(kind: ScanKind, agent: &MachineAgent, found: &DiscoveredMachine) -> bool {
    match kind {
        ScanKind::Network => agent.name() == found.name && agent.address() == found.address,
        ScanKind::Serial => agent.port() == found.port,
    }
}

/// Reconcile a scan snapshot against the known agents of one transport
///
/// `create` builds the agent for a machine seen for the first time.
pub fn reconcile<F>(
    known: &[Arc<MachineAgent>],
    discovered: &[DiscoveredMachine],
    kind: ScanKind,
    mut create: F,
) -> Reconciled
where
    F: FnMut(&DiscoveredMachine) -> Arc<MachineAgent>,
{
    let mut changed = false;
    let mut agents: Vec<Arc<MachineAgent>> = Vec::with_capacity(known.len());

    for agent in known {
        let seen = discovered.iter().any(|found| same_machine(kind, agent, found));
        if seen || agent.added_by_user() {
            agents.push(agent.clone());
        } else {
            tracing::debug!("{} no longer answers discovery", agent.name());
            changed = true;
        }
    }

    for found in discovered {
        if !agents.iter().any(|agent| same_machine(kind, agent, found)) {
            agents.push(create(found));
            changed = true;
        }
    }

    Reconciled { agents, changed }
}

#[derive(Default)]
struct ScanFlag {
    scanning: bool,
    generation: u64,
    reset_timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ScanFlags {
    network: ScanFlag,
    serial: ScanFlag,
}

impl ScanFlags {
    fn get(&mut self, kind: ScanKind) -> &mut ScanFlag {
        match kind {
            ScanKind::Network => &mut self.network,
            ScanKind::Serial => &mut self.serial,
        }
    }
}

/// Keeps the known-machine lists and runs scans
pub struct DiscoveryService {
    bus: Arc<EventBus>,
    config: DiscoveryConfig,
    client: reqwest::Client,
    network_agents: Mutex<Vec<Arc<MachineAgent>>>,
    serial_agents: Mutex<Vec<Arc<MachineAgent>>>,
    scans: Arc<Mutex<ScanFlags>>,
}

impl DiscoveryService {
    /// Create a service publishing on `bus`
    pub fn new(bus: Arc<EventBus>, config: DiscoveryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.transport.request_timeout)
            .build()
            .map_err(|e| ConnectionError::Http {
                reason: e.to_string(),
            })?;
        Ok(Self {
            bus,
            config,
            client,
            network_agents: Mutex::new(Vec::new()),
            serial_agents: Mutex::new(Vec::new()),
            scans: Arc::new(Mutex::new(ScanFlags::default())),
        })
    }

    /// Discovery parameters
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Known networked machines
    pub fn network_agents(&self) -> Vec<Arc<MachineAgent>> {
        self.network_agents.lock().clone()
    }

    /// Known serial machines
    pub fn serial_agents(&self) -> Vec<Arc<MachineAgent>> {
        self.serial_agents.lock().clone()
    }

    /// Look up an agent by id
    pub fn find(&self, id: Uuid) -> Option<Arc<MachineAgent>> {
        self.network_agents
            .lock()
            .iter()
            .chain(self.serial_agents.lock().iter())
            .find(|agent| agent.id() == id)
            .cloned()
    }

    /// Whether a scan of `kind` is in progress
    pub fn is_scanning(&self, kind: ScanKind) -> bool {
        self.scans.lock().get(kind).scanning
    }

    /// Mark a scan as started and arm the auto-reset timer
    ///
    /// Must be called within a tokio runtime.
    pub fn begin_scan(&self, kind: ScanKind) {
        let scans = self.scans.clone();
        let timeout = self.config.scan_timeout;

        let mut flags = self.scans.lock();
        let flag = flags.get(kind);
        flag.scanning = true;
        flag.generation += 1;
        let generation = flag.generation;
        if let Some(timer) = flag.reset_timer.take() {
            timer.abort();
        }

        flag.reset_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut flags = scans.lock();
            let flag = flags.get(kind);
            if flag.generation == generation && flag.scanning {
                tracing::debug!("{:?} scan reset after {:?} without completion", kind, timeout);
                flag.scanning = false;
                flag.reset_timer = None;
            }
        }));
    }

    fn end_scan(&self, kind: ScanKind) {
        let mut flags = self.scans.lock();
        let flag = flags.get(kind);
        flag.scanning = false;
        if let Some(timer) = flag.reset_timer.take() {
            timer.abort();
        }
    }

    /// Finish a scan with its snapshot; returns whether membership changed
    pub fn complete_scan(&self, kind: ScanKind, discovered: &[DiscoveredMachine]) -> bool {
        self.end_scan(kind);

        let reconciled = {
            let mut agents = self.agents(kind).lock();
            let reconciled = reconcile(&agents, discovered, kind, |found| self.create_agent(kind, found));
            *agents = reconciled.agents.clone();
            reconciled
        };

        if reconciled.changed {
            self.publish(kind, &reconciled.agents);
        }
        reconciled.changed
    }

    /// Broadcast a discovery datagram and reconcile the replies
    pub async fn scan_network(&self) -> Result<Vec<Arc<MachineAgent>>> {
        self.begin_scan(ScanKind::Network);
        match udp::scan_network(self.config.broadcast_target(), self.config.listen_window).await {
            Ok(found) => {
                tracing::info!("Network scan found {} machine(s)", found.len());
                self.complete_scan(ScanKind::Network, &found);
                Ok(self.network_agents())
            }
            Err(e) => {
                self.end_scan(ScanKind::Network);
                tracing::warn!("Network scan failed: {}", e);
                Err(e)
            }
        }
    }

    /// Enumerate serial ports and reconcile them
    pub async fn scan_serial(&self) -> Result<Vec<Arc<MachineAgent>>> {
        self.begin_scan(ScanKind::Serial);
        let ports = tokio::task::spawn_blocking(list_ports)
            .await
            .map_err(|e| Error::other(format!("Serial scan task failed: {}", e)))
            .and_then(|ports| ports);

        match ports {
            Ok(ports) => {
                let found: Vec<DiscoveredMachine> = ports
                    .iter()
                    .map(|port| DiscoveredMachine::serial(&port.port_name))
                    .collect();
                tracing::info!("Serial scan found {} port(s)", found.len());
                self.complete_scan(ScanKind::Serial, &found);
                Ok(self.serial_agents())
            }
            Err(e) => {
                self.end_scan(ScanKind::Serial);
                Err(e)
            }
        }
    }

    /// Add a networked machine by hand; it survives later scans
    pub fn add_network_machine(
        &self,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Arc<MachineAgent> {
        let found = DiscoveredMachine::network(name, address);
        let agent = {
            let mut agents = self.network_agents.lock();
            if let Some(existing) = agents
                .iter()
                .find(|agent| same_machine(ScanKind::Network, agent, &found))
            {
                return existing.clone();
            }
            let info = AgentInfo::network(found.name.clone(), found.address.clone()).added_by_user(true);
            let agent = Arc::new(MachineAgent::with_client(info, &self.client, &self.config.transport));
            agents.push(agent.clone());
            agent
        };
        self.publish(ScanKind::Network, &self.network_agents());
        agent
    }

    /// Add a serial machine by hand; it survives later scans
    pub fn add_serial_machine(&self, port: impl Into<String>) -> Arc<MachineAgent> {
        let found = DiscoveredMachine::serial(port);
        let agent = {
            let mut agents = self.serial_agents.lock();
            if let Some(existing) = agents
                .iter()
                .find(|agent| same_machine(ScanKind::Serial, agent, &found))
            {
                return existing.clone();
            }
            let info = AgentInfo::serial(found.port.clone())
                .with_baud_rate(self.config.baud_rate)
                .with_protocol(self.config.protocol)
                .added_by_user(true);
            let agent = Arc::new(MachineAgent::with_client(info, &self.client, &self.config.transport));
            agents.push(agent.clone());
            agent
        };
        self.publish(ScanKind::Serial, &self.serial_agents());
        agent
    }

    /// Remove a machine from whichever list holds it
    pub fn remove_machine(&self, id: Uuid) -> bool {
        for kind in [ScanKind::Network, ScanKind::Serial] {
            let remaining = {
                let mut agents = self.agents(kind).lock();
                let before = agents.len();
                agents.retain(|agent| agent.id() != id);
                (agents.len() != before).then(|| agents.clone())
            };
            if let Some(remaining) = remaining {
                self.publish(kind, &remaining);
                return true;
            }
        }
        false
    }

    fn agents(&self, kind: ScanKind) -> &Mutex<Vec<Arc<MachineAgent>>> {
        match kind {
            ScanKind::Network => &self.network_agents,
            ScanKind::Serial => &self.serial_agents,
        }
    }

    fn create_agent(&self, kind: ScanKind, found: &DiscoveredMachine) -> Arc<MachineAgent> {
        let info = match kind {
            ScanKind::Network => AgentInfo::network(found.name.clone(), found.address.clone())
                .with_model(found.model.clone())
                .with_reported_status(found.status.clone()),
            ScanKind::Serial => AgentInfo::serial(found.port.clone())
                .with_baud_rate(self.config.baud_rate)
                .with_protocol(self.config.protocol),
        };
        Arc::new(MachineAgent::with_client(info, &self.client, &self.config.transport))
    }

    fn publish(&self, kind: ScanKind, agents: &[Arc<MachineAgent>]) {
        let machines = agents.iter().map(|agent| agent.summary()).collect();
        let event = match kind {
            ScanKind::Network => DiscoveryEvent::NetworkMachines { machines },
            ScanKind::Serial => DiscoveryEvent::SerialPorts { machines },
        };
        self.bus.publish(AppEvent::Discovery(event));
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        let mut guard = self.scans.lock();
        let flags = &mut *guard;
        for flag in [&mut flags.network, &mut flags.serial] {
            if let Some(timer) = flag.reset_timer.take() {
                timer.abort();
            }
        }
    }
}

impl std::fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryService")
            .field("config", &self.config)
            .field("network_agents", &self.network_agents.lock().len())
            .field("serial_agents", &self.serial_agents.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(info: AgentInfo) -> Arc<MachineAgent> {
        Arc::new(MachineAgent::new(info, &TransportOptions::default()).unwrap())
    }

    #[test]
    fn test_reconcile_network_membership() {
        let kept = agent(AgentInfo::network("A", "10.0.0.1"));
        let gone = agent(AgentInfo::network("B", "10.0.0.2"));
        let manual = agent(AgentInfo::network("C", "10.0.0.3").added_by_user(true));
        let known = vec![kept.clone(), gone.clone(), manual.clone()];

        let discovered = vec![
            DiscoveredMachine::network("A", "10.0.0.1"),
            DiscoveredMachine::network("D", "10.0.0.4"),
        ];
        let reconciled = reconcile(&known, &discovered, ScanKind::Network, |found| {
            agent(AgentInfo::network(found.name.clone(), found.address.clone()))
        });

        assert!(reconciled.changed);
        let names: Vec<&str> = reconciled.agents.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["A", "C", "D"]);
        assert!(Arc::ptr_eq(&reconciled.agents[0], &kept));
        assert!(Arc::ptr_eq(&reconciled.agents[1], &manual));
    }

    #[test]
    fn test_reconcile_unchanged_in_any_order() {
        let a = agent(AgentInfo::network("A", "10.0.0.1"));
        let b = agent(AgentInfo::network("B", "10.0.0.2"));
        let discovered = vec![
            DiscoveredMachine::network("B", "10.0.0.2"),
            DiscoveredMachine::network("A", "10.0.0.1"),
        ];
        let reconciled = reconcile(&[a.clone(), b.clone()], &discovered, ScanKind::Network, |_| {
            panic!("no agent should be created")
        });
        assert!(!reconciled.changed);
        assert!(Arc::ptr_eq(&reconciled.agents[0], &a));
        assert!(Arc::ptr_eq(&reconciled.agents[1], &b));
    }

    #[test]
    fn test_reconcile_network_equality_uses_name_and_address() {
        let renamed = agent(AgentInfo::network("Old", "10.0.0.1"));
        let discovered = vec![DiscoveredMachine::network("New", "10.0.0.1")];
        let reconciled = reconcile(&[renamed], &discovered, ScanKind::Network, |found| {
            agent(AgentInfo::network(found.name.clone(), found.address.clone()))
        });
        assert!(reconciled.changed);
        assert_eq!(reconciled.agents.len(), 1);
        assert_eq!(reconciled.agents[0].name(), "New");
    }

    #[test]
    fn test_reconcile_serial_by_port() {
        let port = agent(AgentInfo::serial("/dev/ttyACM0"));
        let discovered = vec![DiscoveredMachine::serial("/dev/ttyACM0")];
        let reconciled = reconcile(&[port.clone()], &discovered, ScanKind::Serial, |_| {
            panic!("no agent should be created")
        });
        assert!(!reconciled.changed);
        assert!(Arc::ptr_eq(&reconciled.agents[0], &port));
    }

    #[tokio::test]
    async fn test_scan_flag_resets_after_timeout() {
        let config = DiscoveryConfig {
            scan_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let service = DiscoveryService::new(Arc::new(EventBus::new()), config).unwrap();

        service.begin_scan(ScanKind::Network);
        assert!(service.is_scanning(ScanKind::Network));
        assert!(!service.is_scanning(ScanKind::Serial));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!service.is_scanning(ScanKind::Network));
    }

    #[tokio::test]
    async fn test_dropping_service_cancels_reset_timers() {
        let service =
            DiscoveryService::new(Arc::new(EventBus::new()), DiscoveryConfig::default()).unwrap();
        service.begin_scan(ScanKind::Network);
        service.begin_scan(ScanKind::Serial);

        let timers: Vec<_> = {
            let flags = service.scans.lock();
            [&flags.network, &flags.serial]
                .iter()
                .map(|flag| flag.reset_timer.as_ref().unwrap().abort_handle())
                .collect()
        };
        drop(service);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(timers.iter().all(|timer| timer.is_finished()));
    }

    #[tokio::test]
    async fn test_completion_clears_flag_and_emits_on_change_only() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.receiver();
        let service = DiscoveryService::new(bus, DiscoveryConfig::default()).unwrap();

        service.begin_scan(ScanKind::Network);
        let found = vec![DiscoveredMachine::network("A", "10.0.0.1")];
        assert!(service.complete_scan(ScanKind::Network, &found));
        assert!(!service.is_scanning(ScanKind::Network));
        assert_eq!(rx.recv().await.unwrap().name(), "machine:discover");

        let before = service.network_agents();
        assert!(!service.complete_scan(ScanKind::Network, &found));
        assert!(Arc::ptr_eq(&before[0], &service.network_agents()[0]));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_manual_machines_survive_and_can_be_removed() {
        let service = DiscoveryService::new(Arc::new(EventBus::new()), DiscoveryConfig::default()).unwrap();
        let manual = service.add_network_machine("Garage", "10.0.0.9");
        assert!(manual.added_by_user());
        assert!(Arc::ptr_eq(&manual, &service.add_network_machine("Garage", "10.0.0.9")));

        service.complete_scan(ScanKind::Network, &[]);
        assert_eq!(service.network_agents().len(), 1);
        assert!(service.find(manual.id()).is_some());

        assert!(service.remove_machine(manual.id()));
        assert!(service.network_agents().is_empty());
        assert!(!service.remove_machine(manual.id()));
    }
}
