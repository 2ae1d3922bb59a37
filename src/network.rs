//! Network records and their local fabric.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use ipnet::IpNet;
use log::{info, warn};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::fabric::Registry;
use crate::idalloc::SequentialIdAllocator;
use crate::ipam::{self, AllocateOptions, IpAllocator};
use crate::neigh::Listener;
use crate::store::{self, Keys, Store};
use crate::tunnel::{self, Tunnel};
use crate::types::{Endpoint, Network, NodeNetworkLink};

/// Namespace handle of a network. Every host derives the same path from
/// the name, which may hold characters that are not valid in a file name.
pub fn netns_path(dir: &Path, name: &str) -> PathBuf {
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    dir.join(format!("vx-{}", &digest[..12]))
}

pub struct NetworkService {
    store: Arc<dyn Store>,
    keys: Keys,
    hostname: String,
    netns_dir: PathBuf,
    registry: Arc<Registry>,
    ipam: IpAllocator,
    vnis: SequentialIdAllocator,
    listener: Listener,
}

impl NetworkService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        keys: Keys,
        hostname: impl Into<String>,
        netns_dir: PathBuf,
        registry: Arc<Registry>,
        ipam: IpAllocator,
        vnis: SequentialIdAllocator,
        listener: Listener,
    ) -> Self {
        Self {
            store,
            keys,
            hostname: hostname.into(),
            netns_dir,
            registry,
            ipam,
            vnis,
            listener,
        }
    }

    /// Create a network cluster-wide and set up its fabric on this host.
    ///
    /// The VNI lock is held from the name check until the record is
    /// written, so the VNI and the name are both unique.
    pub async fn create(&self, name: &str, kind: &str, ip_range: IpNet) -> Result<Network> {
        if name.is_empty() {
            return Err(Error::InvalidInput("network name is empty".into()));
        }
        self.registry.get(kind)?;
        let ip_range = ip_range.trunc();
        if ipam::address_count(&ip_range)? < 4 {
            return Err(Error::InvalidCidr(format!(
                "{} leaves no room for endpoints",
                ip_range
            )));
        }

        let lock = self.vnis.lock().await?;
        let created = self.create_locked(name, kind, ip_range).await;
        if let Err(e) = self.vnis.unlock(lock).await {
            warn!("Failed to release VNI lock after creating {}: {}", name, e);
        }
        let network = created?;
        info!(
            "Created network {} ({}) vni {} range {}",
            network.name, network.id, network.vni, network.ip_range
        );

        self.ensure_local(&network).await?;
        Ok(network)
    }

    async fn create_locked(&self, name: &str, kind: &str, ip_range: IpNet) -> Result<Network> {
        if self.list().await?.iter().any(|n| n.name == name) {
            return Err(Error::AlreadyExists(format!("network {}", name)));
        }
        let vni = self.vnis.generate().await?;
        let id = Uuid::new_v4().to_string();
        let gateway = self
            .ipam
            .allocate(&id, &AllocateOptions::new(ip_range))
            .await?;

        let network = Network {
            id,
            name: name.to_string(),
            kind: kind.to_string(),
            netns: netns_path(&self.netns_dir, name),
            vni,
            ip_range,
            gateway,
            created_at: Utc::now(),
        };
        store::put_json(&*self.store, &self.keys.network(&network.id), &network).await?;
        Ok(network)
    }

    pub async fn list(&self) -> Result<Vec<Network>> {
        store::list_json(&*self.store, &self.keys.networks()).await
    }

    pub async fn get(&self, id: &str) -> Result<Network> {
        match store::get_json(&*self.store, &self.keys.network(id)).await {
            Err(e) if e.is_not_found() => Err(Error::NotFound(format!("network {}", id))),
            other => other,
        }
    }

    /// Build the fabric of network `id` on this host.
    pub async fn ensure(&self, id: &str) -> Result<Network> {
        let network = self.get(id).await?;
        self.ensure_local(&network).await?;
        Ok(network)
    }

    /// Ensure the fabric and remember that this host carries it.
    pub async fn ensure_local(&self, network: &Network) -> Result<()> {
        self.registry.for_network(network)?.ensure(network).await?;

        let key = self.keys.node_network(&self.hostname, &network.id);
        match store::get_json::<NodeNetworkLink>(&*self.store, &key).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                let link = NodeNetworkLink {
                    hostname: self.hostname.clone(),
                    network_id: network.id.clone(),
                    created_at: Utc::now(),
                };
                store::put_json(&*self.store, &key, &link).await
            }
            Err(e) => Err(e),
        }
    }

    /// Delete network `id`. Refused while any endpoint references it.
    ///
    /// Only this host's fabric is torn down; other hosts drop theirs when
    /// they next reconcile.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let network = self.get(id).await?;
        let endpoints: Vec<Endpoint> =
            store::list_json(&*self.store, &self.keys.network_endpoints(id)).await?;
        if !endpoints.is_empty() {
            return Err(Error::NetworkInUse(id.to_string()));
        }

        self.listener.stop_listen_network_change(id);
        self.registry.for_network(&network)?.delete(&network).await?;
        self.ipam.release_pool(id).await?;
        store::delete_if_exists(&*self.store, &self.keys.network(id)).await?;
        store::delete_if_exists(&*self.store, &self.keys.node_network(&self.hostname, id)).await?;
        info!("Deleted network {} ({})", network.name, id);
        Ok(())
    }

    /// Open a TCP stream to `ip:port` from inside network `id`.
    pub async fn connect(&self, id: &str, ip: IpAddr, port: u16) -> Result<Tunnel> {
        let network = self.get(id).await?;
        if !network.ip_range.contains(&ip) {
            return Err(Error::InvalidAddress(format!(
                "{} is outside network {} ({})",
                ip, network.name, network.ip_range
            )));
        }
        tunnel::connect(&network.netns, ip, port).await
    }
}
