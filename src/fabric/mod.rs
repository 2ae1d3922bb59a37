//! Network fabric managers.
//!
//! A network's type tag selects the [`NetworkManager`] that knows how to
//! build its data plane on this host. Managers are registered once at
//! startup in a [`Registry`] and looked up per call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::{Endpoint, Network};

pub mod overlay;

pub use overlay::OverlayManager;

/// How to wire an endpoint into its workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateOptions {
    /// Namespace handle of the workload, e.g. `/proc/1234/ns/net`.
    pub netns: String,
    /// Leave the workload leg in the host namespace.
    pub skip_netns_move: bool,
    /// Do not configure the endpoint address on the workload leg.
    pub skip_address: bool,
}

impl ActivateOptions {
    pub fn new(netns: impl Into<String>) -> Self {
        Self {
            netns: netns.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Make the network's data plane exist on this host. Idempotent.
    async fn ensure(&self, network: &Network) -> Result<()>;

    /// Tear the data plane down, refusing while endpoints are attached.
    async fn deactivate(&self, network: &Network) -> Result<()>;

    /// Deactivate and release the namespace.
    async fn delete(&self, network: &Network) -> Result<()>;

    /// Create or repair the endpoint's wiring, recording interface names
    /// and MACs in `endpoint`.
    async fn ensure_endpoint(
        &self,
        network: &Network,
        endpoint: &mut Endpoint,
        opts: &ActivateOptions,
    ) -> Result<()>;

    /// Remove the endpoint's wiring. Fails with
    /// [`Error::EndpointDisabled`] when there is nothing to remove.
    async fn delete_endpoint(&self, network: &Network, endpoint: &Endpoint) -> Result<()>;

    async fn add_endpoint_neigh(&self, network: &Network, endpoint: &Endpoint) -> Result<()>;

    async fn remove_endpoint_neigh(&self, network: &Network, endpoint: &Endpoint) -> Result<()>;

    /// Replay [`NetworkManager::add_endpoint_neigh`] for every active endpoint.
    async fn ensure_endpoints_neigh(&self, network: &Network, endpoints: &[Endpoint]) -> Result<()> {
        for endpoint in endpoints.iter().filter(|e| e.active) {
            self.add_endpoint_neigh(network, endpoint).await?;
        }
        Ok(())
    }
}

/// Network type tag to manager.
#[derive(Clone, Default)]
pub struct Registry {
    managers: HashMap<String, Arc<dyn NetworkManager>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, manager: Arc<dyn NetworkManager>) {
        self.managers.insert(kind.into(), manager);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn NetworkManager>> {
        self.managers
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownNetworkType(kind.to_string()))
    }

    pub fn for_network(&self, network: &Network) -> Result<Arc<dyn NetworkManager>> {
        self.get(&network.kind)
    }
}
