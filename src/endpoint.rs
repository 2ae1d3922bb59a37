//! Endpoint lifecycle.
//!
//! ```text
//! Created --activate--> Activated --deactivate--> Deactivated --delete--> (gone)
//!    ^                                                 |
//!    +-------------------------------------------------+ (activate again)
//! ```
//!
//! Every endpoint is stored twice: under its host and under its network.
//! Writes go host copy first, network copy second; the network copy is the
//! one other hosts watch. Callers serialise operations on one endpoint id.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::fabric::{ActivateOptions, Registry};
use crate::ipam::{AllocateOptions, IpAllocator};
use crate::neigh::Listener;
use crate::netlink;
use crate::network::NetworkService;
use crate::store::{self, Keys, Store};
use crate::types::{Endpoint, PluginBinding};

/// Locally administered prefix of MACs derived from IPv4 addresses.
const MAC_PREFIX: [u8; 2] = [0x02, 0x84];

/// MAC for an IPv4 endpoint address: the fixed prefix then the four octets.
pub fn derive_mac(address: IpAddr) -> Result<String> {
    match address {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            Ok(format!(
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                MAC_PREFIX[0], MAC_PREFIX[1], o[0], o[1], o[2], o[3]
            ))
        }
        IpAddr::V6(_) => Err(Error::InvalidInput(format!(
            "cannot derive a MAC from {}, supply one",
            address
        ))),
    }
}

/// Parameters of [`EndpointController::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateEndpoint {
    pub network_id: String,
    /// Wire the endpoint immediately using `activation`.
    pub activate: bool,
    pub activation: ActivateOptions,
    pub address: Option<IpAddr>,
    pub mac: Option<String>,
}

impl CreateEndpoint {
    pub fn new(network_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            ..Default::default()
        }
    }

    pub fn address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    pub fn activate(mut self, opts: ActivateOptions) -> Self {
        self.activate = true;
        self.activation = opts;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct EndpointFilter {
    pub network_id: Option<String>,
    pub hostname: Option<String>,
}

impl EndpointFilter {
    fn matches(&self, endpoint: &Endpoint) -> bool {
        self.network_id
            .as_ref()
            .map_or(true, |id| &endpoint.network_id == id)
            && self
                .hostname
                .as_ref()
                .map_or(true, |host| &endpoint.hostname == host)
    }
}

pub struct EndpointController {
    store: Arc<dyn Store>,
    keys: Keys,
    hostname: String,
    host_ip: IpAddr,
    ipam: IpAllocator,
    registry: Arc<Registry>,
    networks: Arc<NetworkService>,
    listener: Listener,
}

impl EndpointController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        keys: Keys,
        hostname: impl Into<String>,
        host_ip: IpAddr,
        ipam: IpAllocator,
        registry: Arc<Registry>,
        networks: Arc<NetworkService>,
        listener: Listener,
    ) -> Self {
        Self {
            store,
            keys,
            hostname: hostname.into(),
            host_ip,
            ipam,
            registry,
            networks,
            listener,
        }
    }

    /// Assign an address and MAC to a new endpoint of this host, and wire
    /// it when asked to.
    pub async fn create(&self, req: CreateEndpoint) -> Result<Endpoint> {
        let network = self.networks.get(&req.network_id).await?;
        self.registry.for_network(&network)?;
        if req.activate && req.activation.netns.is_empty() {
            return Err(Error::InvalidInput(
                "activation requested without a target namespace".into(),
            ));
        }
        let supplied_mac = req.mac.as_deref().map(netlink::parse_mac).transpose()?;
        if supplied_mac.is_none() && !network.ip_range.addr().is_ipv4() {
            return Err(Error::InvalidInput(format!(
                "network {} is not IPv4, a MAC must be supplied",
                network.id
            )));
        }

        let mut opts = AllocateOptions::new(network.ip_range);
        if let Some(address) = req.address {
            opts = opts.requested(address);
        }
        let target_ip = self.ipam.allocate(&network.id, &opts).await?;
        let target_mac = match supplied_mac {
            Some(mac) => mac,
            None => derive_mac(target_ip.addr())?,
        };

        let endpoint = Endpoint {
            id: Uuid::new_v4().to_string(),
            network_id: network.id.clone(),
            hostname: self.hostname.clone(),
            host_ip: Some(self.host_ip),
            created_at: Some(Utc::now()),
            target_mac,
            target_ip: Some(target_ip),
            ..Default::default()
        };
        self.save(&endpoint).await?;
        info!(
            "Created endpoint {} {} ({}) in network {}",
            endpoint.id, target_ip, endpoint.target_mac, network.id
        );

        if req.activate {
            return self.activate(&endpoint.id, &req.activation).await;
        }
        Ok(endpoint)
    }

    /// Endpoints matching `filter`, from the per-network copies when a
    /// network is given and the per-host copies otherwise.
    pub async fn list(&self, filter: &EndpointFilter) -> Result<Vec<Endpoint>> {
        let prefix = match (&filter.network_id, &filter.hostname) {
            (Some(network_id), _) => self.keys.network_endpoints(network_id),
            (None, Some(hostname)) => self.keys.host_endpoints(hostname),
            (None, None) => self.keys.all_network_endpoints(),
        };
        let mut endpoints: Vec<Endpoint> = store::list_json(&*self.store, &prefix).await?;
        endpoints.retain(|e| filter.matches(e));
        Ok(endpoints)
    }

    pub async fn get(&self, id: &str) -> Result<Endpoint> {
        let local = self.keys.host_endpoint(&self.hostname, id);
        match store::get_json(&*self.store, &local).await {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }
        self.list(&EndpointFilter::default())
            .await?
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::NotFound(format!("endpoint {}", id)))
    }

    /// Wire the endpoint into `opts.netns`. Safe to repeat: existing wiring
    /// is checked and repaired rather than duplicated.
    pub async fn activate(&self, id: &str, opts: &ActivateOptions) -> Result<Endpoint> {
        if opts.netns.is_empty() {
            return Err(Error::InvalidInput(format!(
                "endpoint {} needs a target namespace",
                id
            )));
        }
        let mut endpoint = self.local(id).await?;
        let network = self.networks.get(&endpoint.network_id).await?;
        let manager = self.registry.for_network(&network)?;

        self.networks.ensure_local(&network).await?;
        manager
            .ensure_endpoint(&network, &mut endpoint, opts)
            .await?;
        endpoint.netns = opts.netns.clone();
        endpoint.active = true;
        self.save(&endpoint).await?;
        info!(
            "Activated endpoint {} in {} via {}",
            endpoint.id, endpoint.netns, endpoint.target_iface
        );

        self.listener.listen_network_change(&network).await?;
        Ok(endpoint)
    }

    /// Remove the endpoint's wiring. An inactive endpoint is left untouched.
    pub async fn deactivate(&self, id: &str) -> Result<Endpoint> {
        let mut endpoint = self.local(id).await?;
        if !endpoint.active {
            debug!("Endpoint {} is already inactive", id);
            return Ok(endpoint);
        }
        let network = self.networks.get(&endpoint.network_id).await?;
        let manager = self.registry.for_network(&network)?;
        match manager.delete_endpoint(&network, &endpoint).await {
            Ok(()) | Err(Error::EndpointDisabled(_)) => {}
            Err(e) => return Err(e),
        }

        endpoint.active = false;
        endpoint.netns.clear();
        self.save(&endpoint).await?;
        info!("Deactivated endpoint {}", id);
        Ok(endpoint)
    }

    /// Remove the endpoint records and return its address to the pool.
    /// An active endpoint is refused unless `force`, which deactivates it.
    pub async fn delete(&self, id: &str, force: bool) -> Result<()> {
        let mut endpoint = self.get(id).await?;
        if endpoint.active {
            if !force {
                return Err(Error::EndpointActive(id.to_string()));
            }
            endpoint = self.deactivate(id).await?;
        }

        store::delete_if_exists(
            &*self.store,
            &self.keys.host_endpoint(&endpoint.hostname, id),
        )
        .await?;
        store::delete_if_exists(
            &*self.store,
            &self.keys.network_endpoint(&endpoint.network_id, id),
        )
        .await?;

        if let Some(address) = endpoint.target_ip {
            match self.ipam.release(&endpoint.network_id, address.addr()).await {
                Err(e) if e.is_not_found() => {
                    debug!("Pool of network {} is gone", endpoint.network_id)
                }
                other => other?,
            }
        }
        info!("Deleted endpoint {}", id);
        Ok(())
    }

    pub async fn bind_plugin(&self, plugin_id: &str, sand_id: &str) -> Result<()> {
        let binding = PluginBinding {
            plugin_id: plugin_id.to_string(),
            sand_id: sand_id.to_string(),
        };
        store::put_json(&*self.store, &self.keys.plugin_binding(plugin_id), &binding).await
    }

    pub async fn plugin_binding(&self, plugin_id: &str) -> Result<PluginBinding> {
        store::get_json(&*self.store, &self.keys.plugin_binding(plugin_id)).await
    }

    pub async fn unbind_plugin(&self, plugin_id: &str) -> Result<()> {
        store::delete_if_exists(&*self.store, &self.keys.plugin_binding(plugin_id)).await
    }

    /// An endpoint owned by this host; wiring only happens where it lives.
    async fn local(&self, id: &str) -> Result<Endpoint> {
        let endpoint = self.get(id).await?;
        if endpoint.hostname != self.hostname {
            return Err(Error::InvalidInput(format!(
                "endpoint {} belongs to host {}",
                id, endpoint.hostname
            )));
        }
        Ok(endpoint)
    }

    async fn save(&self, endpoint: &Endpoint) -> Result<()> {
        store::put_json(
            &*self.store,
            &self.keys.host_endpoint(&endpoint.hostname, &endpoint.id),
            endpoint,
        )
        .await?;
        store::put_json(
            &*self.store,
            &self.keys.network_endpoint(&endpoint.network_id, &endpoint.id),
            endpoint,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::netlink::memory::MemoryNetlink;
    use crate::netlink::{find_link, find_link_by_mac, Netns};
    use crate::store::MemoryStore;
    use crate::testutil::{eventually, remote_endpoint, test_config, HOSTNAME, TARGET_NS};
    use crate::types::{Network, NETWORK_TYPE_OVERLAY};

    async fn setup() -> (Agent, Arc<MemoryNetlink>, Arc<MemoryStore>, Network) {
        let kernel = Arc::new(MemoryNetlink::new());
        kernel.add_namespace(TARGET_NS);
        let store = Arc::new(MemoryStore::new());
        let agent = Agent::new(test_config(), store.clone(), kernel.clone());
        let network = agent
            .networks
            .create("n1", NETWORK_TYPE_OVERLAY, "10.0.0.0/24".parse().unwrap())
            .await
            .unwrap();
        (agent, kernel, store, network)
    }

    #[test]
    fn test_derive_mac() {
        assert_eq!(
            derive_mac("10.0.0.5".parse().unwrap()).unwrap(),
            "02:84:0a:00:00:05"
        );
        assert_eq!(
            derive_mac("192.168.255.1".parse().unwrap()).unwrap(),
            "02:84:c0:a8:ff:01"
        );
        assert!(derive_mac("fd00::1".parse().unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_create_activate_delete_scenario() {
        let (agent, kernel, _store, network) = setup().await;
        let endpoints = &agent.endpoints;

        let endpoint = endpoints
            .create(CreateEndpoint::new(&network.id).address("10.0.0.5".parse().unwrap()))
            .await
            .unwrap();
        assert_eq!(endpoint.target_mac, "02:84:0a:00:00:05");
        assert_eq!(endpoint.target_ip, Some("10.0.0.5/24".parse().unwrap()));
        assert_eq!(endpoint.hostname, HOSTNAME);
        assert!(!endpoint.active);

        let active = endpoints
            .activate(&endpoint.id, &ActivateOptions::new(TARGET_NS))
            .await
            .unwrap();
        assert!(active.active);
        assert_eq!(active.netns, TARGET_NS);

        let target_ns = Netns::path(TARGET_NS);
        let target_links = kernel.snapshot(&target_ns);
        let target = find_link_by_mac(&target_links, "02:84:0a:00:00:05").unwrap();
        assert!(target.up);
        assert_eq!(
            kernel.addrs_of(&target_ns, &target.name),
            vec!["10.0.0.5/24".parse::<ipnet::IpNet>().unwrap()]
        );
        let overlay_links = kernel.snapshot(&Netns::Path(network.netns.clone()));
        assert!(find_link(&overlay_links, &active.overlay_iface).unwrap().up);

        // Both copies carry the activation.
        let by_network = endpoints
            .list(&EndpointFilter {
                network_id: Some(network.id.clone()),
                hostname: None,
            })
            .await
            .unwrap();
        let by_host = endpoints
            .list(&EndpointFilter {
                network_id: None,
                hostname: Some(HOSTNAME.into()),
            })
            .await
            .unwrap();
        assert_eq!(by_network, vec![active.clone()]);
        assert_eq!(by_host, vec![active.clone()]);

        let err = endpoints.delete(&endpoint.id, false).await.unwrap_err();
        assert!(matches!(err, Error::EndpointActive(_)));
        assert!(err.to_string().contains("is still active"));

        endpoints.delete(&endpoint.id, true).await.unwrap();
        assert!(endpoints.get(&endpoint.id).await.unwrap_err().is_not_found());
        assert!(find_link_by_mac(&kernel.snapshot(&target_ns), "02:84:0a:00:00:05").is_none());

        // The address went back to the pool.
        let again = endpoints
            .create(CreateEndpoint::new(&network.id).address("10.0.0.5".parse().unwrap()))
            .await
            .unwrap();
        assert_eq!(again.target_ip, Some("10.0.0.5/24".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_create_allocates_after_gateway() {
        let (agent, _kernel, _store, network) = setup().await;
        let first = agent
            .endpoints
            .create(CreateEndpoint::new(&network.id))
            .await
            .unwrap();
        let second = agent
            .endpoints
            .create(CreateEndpoint::new(&network.id).mac("02:AA:BB:CC:DD:EE"))
            .await
            .unwrap();
        assert_eq!(first.target_ip, Some("10.0.0.2/24".parse().unwrap()));
        assert_eq!(first.target_mac, "02:84:0a:00:00:02");
        assert_eq!(second.target_ip, Some("10.0.0.3/24".parse().unwrap()));
        assert_eq!(second.target_mac, "02:aa:bb:cc:dd:ee");

        let err = agent
            .endpoints
            .create(CreateEndpoint::new(&network.id).address("10.0.0.2".parse().unwrap()))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let (agent, _kernel, _store, network) = setup().await;
        let endpoints = &agent.endpoints;

        let err = endpoints
            .create(CreateEndpoint::new(&network.id).mac("not-a-mac"))
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());
        let err = endpoints
            .create(CreateEndpoint::new(&network.id).activate(ActivateOptions::default()))
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());
        let err = endpoints
            .create(CreateEndpoint::new("missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(endpoints.list(&EndpointFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_with_activation() {
        let (agent, kernel, _store, network) = setup().await;
        let endpoint = agent
            .endpoints
            .create(CreateEndpoint::new(&network.id).activate(ActivateOptions::new(TARGET_NS)))
            .await
            .unwrap();
        assert!(endpoint.active);
        assert!(agent.listener.is_listening(&network.id));
        let target_links = kernel.snapshot(&Netns::path(TARGET_NS));
        assert!(find_link(&target_links, &endpoint.target_iface).is_some());
    }

    #[tokio::test]
    async fn test_activate_requires_namespace() {
        let (agent, _kernel, _store, network) = setup().await;
        let endpoint = agent
            .endpoints
            .create(CreateEndpoint::new(&network.id))
            .await
            .unwrap();
        let err = agent
            .endpoints
            .activate(&endpoint.id, &ActivateOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[tokio::test]
    async fn test_activate_twice_reuses_wiring() {
        let (agent, kernel, _store, network) = setup().await;
        let opts = ActivateOptions::new(TARGET_NS);
        let endpoint = agent
            .endpoints
            .create(CreateEndpoint::new(&network.id).activate(opts.clone()))
            .await
            .unwrap();
        kernel.clear_ops();

        let again = agent.endpoints.activate(&endpoint.id, &opts).await.unwrap();
        assert_eq!(again, endpoint);
        assert!(kernel.ops().is_empty(), "unexpected ops: {:?}", kernel.ops());
    }

    #[tokio::test]
    async fn test_deactivate_inactive_touches_nothing() {
        let (agent, kernel, _store, network) = setup().await;
        let endpoint = agent
            .endpoints
            .create(CreateEndpoint::new(&network.id))
            .await
            .unwrap();
        kernel.clear_ops();

        let result = agent.endpoints.deactivate(&endpoint.id).await.unwrap();
        assert_eq!(result, endpoint);
        assert!(kernel.ops().is_empty());
    }

    #[tokio::test]
    async fn test_deactivate_then_reactivate() {
        let (agent, kernel, _store, network) = setup().await;
        let opts = ActivateOptions::new(TARGET_NS);
        let endpoint = agent
            .endpoints
            .create(CreateEndpoint::new(&network.id).activate(opts.clone()))
            .await
            .unwrap();

        let inactive = agent.endpoints.deactivate(&endpoint.id).await.unwrap();
        assert!(!inactive.active);
        assert!(inactive.netns.is_empty());
        let overlay_ns = Netns::Path(network.netns.clone());
        assert!(find_link(&kernel.snapshot(&overlay_ns), &endpoint.overlay_iface).is_none());
        assert_eq!(agent.endpoints.get(&endpoint.id).await.unwrap(), inactive);

        // Leftover names point at nothing, so a fresh pair is built.
        let active = agent.endpoints.activate(&endpoint.id, &opts).await.unwrap();
        assert!(active.active);
        assert!(find_link(&kernel.snapshot(&overlay_ns), &active.overlay_iface).is_some());
    }

    #[tokio::test]
    async fn test_remote_endpoints_reach_local_neighbor_tables() {
        let (agent, kernel, store, network) = setup().await;
        agent
            .endpoints
            .create(CreateEndpoint::new(&network.id).activate(ActivateOptions::new(TARGET_NS)))
            .await
            .unwrap();

        // Another host writes its endpoint.
        let mut remote = remote_endpoint("ep-remote", "10.0.0.9/24");
        remote.network_id = network.id.clone();
        let keys = Keys::new("/vxmesh");
        store::put_json(&*store, &keys.host_endpoint("host-b", &remote.id), &remote)
            .await
            .unwrap();
        store::put_json(&*store, &keys.network_endpoint(&network.id, &remote.id), &remote)
            .await
            .unwrap();

        let overlay_ns = Netns::Path(network.netns.clone());
        assert!(eventually(|| kernel.neighbors(&overlay_ns).len() == 1).await);
        assert_eq!(kernel.fdb(&overlay_ns).len(), 1);

        // Remote records cannot be rewired from here.
        let err = agent
            .endpoints
            .activate(&remote.id, &ActivateOptions::new(TARGET_NS))
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());

        store.delete(&keys.network_endpoint(&network.id, &remote.id)).await.unwrap();
        assert!(eventually(|| kernel.neighbors(&overlay_ns).is_empty()).await);
        assert!(kernel.fdb(&overlay_ns).is_empty());
    }

    #[tokio::test]
    async fn test_plugin_bindings() {
        let (agent, _kernel, _store, _network) = setup().await;
        let endpoints = &agent.endpoints;
        endpoints.bind_plugin("plugin-1", "sand-1").await.unwrap();
        let binding = endpoints.plugin_binding("plugin-1").await.unwrap();
        assert_eq!(binding.sand_id, "sand-1");

        endpoints.unbind_plugin("plugin-1").await.unwrap();
        endpoints.unbind_plugin("plugin-1").await.unwrap();
        assert!(endpoints.plugin_binding("plugin-1").await.unwrap_err().is_not_found());
    }
}
