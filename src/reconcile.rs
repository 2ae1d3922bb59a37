//! Convergence after restarts and interrupted writes.
//!
//! Kernel state under `/var/run` does not survive a reboot and endpoint
//! records are written in two steps. Both are repaired from the store:
//! node links say which fabrics this host must carry, and the per-network
//! endpoint copy wins over the per-host one.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{info, warn};

use crate::error::Result;
use crate::neigh::Listener;
use crate::network::NetworkService;
use crate::store::{self, Keys, Store};
use crate::types::{Endpoint, NodeNetworkLink};

/// Disagreement between the two stored copies of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyMismatch {
    /// Only the per-network copy exists.
    MissingHostCopy(Endpoint),
    /// Only the per-host copy exists.
    MissingNetworkCopy(Endpoint),
    Diverged { network: Endpoint, host: Endpoint },
}

impl CopyMismatch {
    pub fn endpoint_id(&self) -> &str {
        match self {
            CopyMismatch::MissingHostCopy(e) | CopyMismatch::MissingNetworkCopy(e) => &e.id,
            CopyMismatch::Diverged { network, .. } => &network.id,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Networks whose fabric was ensured and is being listened to.
    pub networks: Vec<String>,
    /// Node links removed because their network no longer exists.
    pub pruned: Vec<String>,
    /// Networks that could not be brought up, with the reason.
    pub failed: Vec<(String, String)>,
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    keys: Keys,
    hostname: String,
    networks: Arc<NetworkService>,
    listener: Listener,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        keys: Keys,
        hostname: impl Into<String>,
        networks: Arc<NetworkService>,
        listener: Listener,
    ) -> Self {
        Self {
            store,
            keys,
            hostname: hostname.into(),
            networks,
            listener,
        }
    }

    /// Rebuild every fabric this host is linked to and resume neighbor
    /// propagation for it. One broken network does not stop the others.
    pub async fn reconcile_node(&self) -> Result<ReconcileReport> {
        let links: Vec<NodeNetworkLink> =
            store::list_json(&*self.store, &self.keys.node_networks(&self.hostname)).await?;
        let mut report = ReconcileReport::default();

        for link in links {
            let network = match self.networks.get(&link.network_id).await {
                Ok(network) => network,
                Err(e) if e.is_not_found() => {
                    warn!(
                        "Network {} linked to {} no longer exists, dropping link",
                        link.network_id, self.hostname
                    );
                    store::delete_if_exists(
                        &*self.store,
                        &self.keys.node_network(&self.hostname, &link.network_id),
                    )
                    .await?;
                    report.pruned.push(link.network_id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Err(e) = self.networks.ensure_local(&network).await {
                warn!("Failed to ensure network {}: {}", network.id, e);
                report.failed.push((network.id, e.to_string()));
                continue;
            }
            // A fresh registration replays the stored endpoints.
            if let Err(e) = self.listener.listen_network_change(&network).await {
                warn!("Failed to listen on network {}: {}", network.id, e);
                report.failed.push((network.id, e.to_string()));
                continue;
            }
            report.networks.push(network.id);
        }

        info!(
            "Reconciled {} networks ({} pruned, {} failed)",
            report.networks.len(),
            report.pruned.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Compare the per-host and per-network copies of every endpoint.
    pub async fn check_endpoint_copies(&self) -> Result<Vec<CopyMismatch>> {
        let by_network: Vec<Endpoint> =
            store::list_json(&*self.store, &self.keys.all_network_endpoints()).await?;
        let by_host: Vec<Endpoint> =
            store::list_json(&*self.store, &self.keys.all_host_endpoints()).await?;

        let mut hosts: BTreeMap<String, Endpoint> =
            by_host.into_iter().map(|e| (e.id.clone(), e)).collect();
        let mut mismatches = Vec::new();
        for network in by_network {
            match hosts.remove(&network.id) {
                None => mismatches.push(CopyMismatch::MissingHostCopy(network)),
                Some(host) if host != network => {
                    mismatches.push(CopyMismatch::Diverged { network, host })
                }
                Some(_) => {}
            }
        }
        mismatches.extend(hosts.into_values().map(CopyMismatch::MissingNetworkCopy));
        Ok(mismatches)
    }

    /// Make the per-host copies agree with the per-network ones. A host
    /// copy without a network copy is a half-written create and is
    /// removed. Returns the repairs made.
    pub async fn repair_endpoint_copies(&self) -> Result<Vec<CopyMismatch>> {
        let mismatches = self.check_endpoint_copies().await?;
        for mismatch in &mismatches {
            match mismatch {
                CopyMismatch::MissingHostCopy(network)
                | CopyMismatch::Diverged { network, .. } => {
                    let key = self.keys.host_endpoint(&network.hostname, &network.id);
                    store::put_json(&*self.store, &key, network).await?;
                }
                CopyMismatch::MissingNetworkCopy(host) => {
                    let key = self.keys.host_endpoint(&host.hostname, &host.id);
                    store::delete_if_exists(&*self.store, &key).await?;
                }
            }
            warn!("Repaired endpoint {}: {}", mismatch.endpoint_id(), kind(mismatch));
        }
        Ok(mismatches)
    }
}

fn kind(mismatch: &CopyMismatch) -> &'static str {
    match mismatch {
        CopyMismatch::MissingHostCopy(_) => "missing host copy",
        CopyMismatch::MissingNetworkCopy(_) => "missing network copy",
        CopyMismatch::Diverged { .. } => "diverged",
    }
}
