//! vxmesh daemon entry point.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::signal;

use vxmesh::netlink::IpCommand;
use vxmesh::{Agent, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!(
        "Starting vxmesh on {} ({}) with config: {:?}",
        cfg.hostname(),
        cfg.host_ip,
        cfg
    );

    // Store and kernel backends
    let store = Agent::connect_store(&cfg).await?;
    let netlink = Arc::new(IpCommand::new(cfg.netlink_timeout()));
    let agent = Agent::new(cfg, store, netlink);

    // Rebuild local fabrics and resume neighbor propagation
    let report = agent.reconciler.reconcile_node().await?;
    for (network, reason) in &report.failed {
        error!("Network {} is not serviced: {}", network, reason);
    }
    match agent.reconciler.repair_endpoint_copies().await {
        Ok(repaired) if !repaired.is_empty() => {
            warn!("Repaired {} endpoint records", repaired.len())
        }
        Ok(_) => {}
        Err(e) => error!("Endpoint record check failed: {}", e),
    }

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    agent.shutdown();

    info!("Shutdown complete.");
    Ok(())
}
