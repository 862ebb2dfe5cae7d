//! Status heartbeat for networked machines

use super::ConnectionSession;
use crate::agent::MachineAgent;
use crate::communication::StatusPoll;
use snapkit_core::{ConnectionError, Error};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Heartbeat timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Delay before the first poll
    pub initial_delay: Duration,
    /// Delay between polls
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            interval: Duration::from_millis(1000),
        }
    }
}

/// Poll `agent` until the session moves past `epoch`
pub(super) fn spawn(
    session: Weak<ConnectionSession>,
    agent: Arc<MachineAgent>,
    epoch: u64,
    config: HeartbeatConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(config.initial_delay).await;

        loop {
            match session.upgrade() {
                Some(s) if s.is_current(epoch) => {}
                _ => break,
            }

            let poll = agent.query_status().await;

            let Some(live) = session.upgrade() else {
                break;
            };
            match poll {
                Ok(StatusPoll::Ready(snapshot)) => live.apply_status(epoch, snapshot),
                Ok(StatusPoll::AwaitingAuth) => live.await_auth(epoch),
                Err(Error::Connection(ConnectionError::Unauthorized)) => {
                    tracing::warn!("{} revoked the session token", agent.name());
                    live.close_unauthorized(epoch, &agent).await;
                    break;
                }
                Err(e) => {
                    tracing::debug!("Heartbeat to {} failed: {}", agent.name(), e);
                }
            }
            drop(live);

            tokio::time::sleep(config.interval).await;
        }

        tracing::debug!("Heartbeat for {} stopped", agent.name());
    })
}
