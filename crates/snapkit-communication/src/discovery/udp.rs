//! UDP broadcast scan for networked machines
//!
//! Machines answer a `discover` datagram with one line per machine:
//!
//! ```text
//! Snapmaker@192.168.1.100|model:A350|status:IDLE
//! ```

use snapkit_core::Result;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Datagram that triggers discovery replies
pub const DISCOVER_MESSAGE: &[u8] = b"discover";

/// Port machines listen on for discovery datagrams
pub const DEFAULT_BROADCAST_PORT: u16 = 20054;

/// A machine seen by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredMachine {
    /// Name reported by the machine, or the port path for serial machines
    pub name: String,
    /// Network address, empty for serial machines
    pub address: String,
    /// Serial port path, empty for networked machines
    pub port: String,
    /// Reported model
    pub model: Option<String>,
    /// Reported workflow status
    pub status: Option<String>,
}

impl DiscoveredMachine {
    /// A networked machine
    pub fn network(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port: String::new(),
            model: None,
            status: None,
        }
    }

    /// A machine on a serial port
    pub fn serial(port: impl Into<String>) -> Self {
        let port = port.into();
        Self {
            name: port.clone(),
            address: String::new(),
            port,
            model: None,
            status: None,
        }
    }
}

/// Parse one discovery reply
pub fn parse_reply(reply: &str) -> Option<DiscoveredMachine> {
    let mut fields = reply.trim().split('|');
    let (name, address) = fields.next()?.split_once('@')?;
    if name.is_empty() || address.is_empty() {
        return None;
    }

    let mut machine = DiscoveredMachine::network(name, address);
    for field in fields {
        match field.split_once(':') {
            Some(("model", model)) => machine.model = Some(model.to_string()),
            Some(("status", status)) => machine.status = Some(status.to_string()),
            _ => {}
        }
    }
    Some(machine)
}

/// Send `discover` to `target` and collect replies for `listen_window`
pub async fn scan_network(
    target: SocketAddr,
    listen_window: Duration,
) -> Result<Vec<DiscoveredMachine>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    socket.send_to(DISCOVER_MESSAGE, target).await?;
    tracing::debug!("Sent discovery datagram to {}", target);

    let deadline = tokio::time::Instant::now() + listen_window;
    let mut found: Vec<DiscoveredMachine> = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        let received = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(received) => received,
        };

        match received {
            Ok((n, from)) => {
                let reply = String::from_utf8_lossy(&buf[..n]);
                match parse_reply(&reply) {
                    Some(machine)
                        if !found
                            .iter()
                            .any(|m| m.name == machine.name && m.address == machine.address) =>
                    {
                        tracing::debug!("{} answered discovery from {}", machine.name, from);
                        found.push(machine);
                    }
                    Some(_) => {}
                    None => tracing::debug!("Ignoring discovery reply from {}: {:?}", from, reply),
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                ) => {}
            Err(e) => {
                tracing::warn!("Discovery receive failed: {}", e);
                break;
            }
        }
    }

    Ok(found)
}
