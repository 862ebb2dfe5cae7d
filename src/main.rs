use snapkit::{discovery_config, init_logging, Config, DiscoveryService, EventBus};
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    tracing::info!("SnapKit {} (built {})", snapkit::VERSION, snapkit::BUILD_DATE);

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => Config::load_from_file(&path)?,
        None => Config::default(),
    };

    let bus = Arc::new(EventBus::new());
    let discovery = DiscoveryService::new(bus, discovery_config(&config)?)?;

    match discovery.scan_serial().await {
        Ok(agents) => {
            for agent in &agents {
                tracing::info!("Serial machine: {}", agent.port());
            }
        }
        Err(e) => tracing::warn!("Serial scan failed: {}", e),
    }

    let agents = discovery.scan_network().await?;
    for agent in &agents {
        let model = agent.info().model.as_deref().unwrap_or("unknown model");
        tracing::info!("Networked machine: {} at {} ({})", agent.name(), agent.address(), model);
    }
    if agents.is_empty() {
        tracing::info!("No networked machines answered");
    }

    Ok(())
}
