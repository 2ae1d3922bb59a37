//! Component wiring.
//!
//! Everything shared is built once here and handed out by `Arc`; the
//! watch-registration table in particular is owned by the agent and not
//! global.

use std::sync::Arc;

use log::info;

use crate::config::{Config, StoreBackend};
use crate::endpoint::EndpointController;
use crate::error::Result;
use crate::fabric::{OverlayManager, Registry};
use crate::idalloc::SequentialIdAllocator;
use crate::ipam::IpAllocator;
use crate::neigh::Listener;
use crate::netlink::Netlink;
use crate::network::NetworkService;
use crate::reconcile::Reconciler;
use crate::store::{EtcdStore, Keys, MemoryStore, Store};
use crate::types::NETWORK_TYPE_OVERLAY;
use crate::watcher::Watcher;

pub struct Agent {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub networks: Arc<NetworkService>,
    pub endpoints: EndpointController,
    pub listener: Listener,
    pub reconciler: Reconciler,
    watcher: Arc<Watcher>,
}

impl Agent {
    pub fn new(config: Config, store: Arc<dyn Store>, netlink: Arc<dyn Netlink>) -> Self {
        let keys = Keys::new(&config.store.prefix);
        let hostname = config.hostname().to_string();

        let mut registry = Registry::new();
        registry.register(
            NETWORK_TYPE_OVERLAY,
            Arc::new(OverlayManager::new(
                netlink,
                config.host_ip,
                config.vxlan_port,
                config.mtu,
            )),
        );
        let registry = Arc::new(registry);

        let watcher = Arc::new(Watcher::new(store.clone()));
        let listener = Listener::new(store.clone(), keys.clone(), registry.clone(), watcher.clone());
        let ipam = IpAllocator::new(store.clone(), keys.clone());
        let vnis = SequentialIdAllocator::new(
            store.clone(),
            keys.networks(),
            "vni",
            keys.lock("vni"),
            config.vni_max,
        )
        .with_lock_timing(config.lock_ttl(), config.lock_wait());

        let networks = Arc::new(NetworkService::new(
            store.clone(),
            keys.clone(),
            hostname.clone(),
            config.netns_dir.clone(),
            registry.clone(),
            ipam.clone(),
            vnis,
            listener.clone(),
        ));
        let endpoints = EndpointController::new(
            store.clone(),
            keys.clone(),
            hostname.clone(),
            config.host_ip,
            ipam,
            registry,
            networks.clone(),
            listener.clone(),
        );
        let reconciler = Reconciler::new(
            store.clone(),
            keys,
            hostname,
            networks.clone(),
            listener.clone(),
        );

        Self {
            config,
            store,
            networks,
            endpoints,
            listener,
            reconciler,
            watcher,
        }
    }

    /// Open the store selected by `config`.
    pub async fn connect_store(config: &Config) -> Result<Arc<dyn Store>> {
        match config.store.backend {
            StoreBackend::Etcd => {
                let store =
                    EtcdStore::connect(&config.store.endpoints, config.request_timeout()).await?;
                Ok(Arc::new(store))
            }
            StoreBackend::Memory => {
                info!("Using in-process store; state is lost on exit");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }

    /// Close every watch registration. Drain tasks exit once their
    /// buffered events are handled.
    pub fn shutdown(&self) {
        info!(
            "Closing {} watch registrations",
            self.watcher.prefixes().len()
        );
        self.watcher.shutdown();
    }
}
