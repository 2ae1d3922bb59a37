//! Neighbor propagation.
//!
//! Each network with local endpoints gets one watch over its per-network
//! endpoint prefix. A drain task per registration turns the stream into
//! static ARP and FDB entries on the network's VXLAN device, so remote
//! endpoints are reachable without flood-and-learn. Entries are upserted
//! and deleted idempotently; events for different keys may interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::fabric::Registry;
use crate::store::{self, Keys, Store, WatchStream};
use crate::types::{Endpoint, EventKind, Network, WatchEvent};
use crate::watcher::Watcher;

/// Cloneable handle; every clone shares the same registrations.
#[derive(Clone)]
pub struct Listener {
    store: Arc<dyn Store>,
    keys: Keys,
    registry: Arc<Registry>,
    watcher: Arc<Watcher>,
    drains: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl Listener {
    pub fn new(
        store: Arc<dyn Store>,
        keys: Keys,
        registry: Arc<Registry>,
        watcher: Arc<Watcher>,
    ) -> Self {
        Self {
            store,
            keys,
            registry,
            watcher,
            drains: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start propagating endpoint changes of `network`. Returns false when
    /// the network is already being listened to.
    ///
    /// A new registration first replays every endpoint already stored,
    /// since the watch only delivers mutations made after it started.
    /// Returns once the replay is done.
    pub async fn listen_network_change(&self, network: &Network) -> Result<bool> {
        let prefix = self.keys.network_endpoints(&network.id);
        let Some(stream) = self.watcher.register(&prefix).await? else {
            return Ok(false);
        };

        let (replayed_tx, replayed_rx) = oneshot::channel();
        let drain = tokio::spawn(self.clone().drain(network.clone(), stream, replayed_tx));
        if let Some(previous) = self.lock_drains().insert(network.id.clone(), drain) {
            previous.abort();
        }
        info!("Listening for endpoint changes of network {}", network.id);

        if replayed_rx.await.is_err() {
            debug!("Listener of network {} stopped before its replay", network.id);
        }
        Ok(true)
    }

    /// Install neighbors for every stored endpoint. The snapshot is read
    /// after the watch started, so later events only move it forward.
    async fn replay(&self, network: &Network) -> Result<usize> {
        let prefix = self.keys.network_endpoints(&network.id);
        let endpoints: Vec<Endpoint> = store::list_json(&*self.store, &prefix).await?;
        let manager = self.registry.for_network(network)?;
        manager.ensure_endpoints_neigh(network, &endpoints).await?;
        Ok(endpoints.len())
    }

    /// Stop propagating changes of `network_id`. The drain task finishes the
    /// events already buffered and exits when the channel closes.
    pub fn stop_listen_network_change(&self, network_id: &str) -> bool {
        let prefix = self.keys.network_endpoints(network_id);
        self.lock_drains().remove(network_id);
        self.watcher.unregister(&prefix)
    }

    pub fn is_listening(&self, network_id: &str) -> bool {
        self.watcher
            .is_registered(&self.keys.network_endpoints(network_id))
    }

    async fn drain(
        self,
        network: Network,
        mut stream: WatchStream,
        replayed: oneshot::Sender<()>,
    ) {
        match self.replay(&network).await {
            Ok(count) => debug!("Replayed {} endpoints of network {}", count, network.id),
            Err(e) => warn!("Failed to replay endpoints of network {}: {}", network.id, e),
        }
        let _ = replayed.send(());

        while let Some(event) = stream.recv().await {
            if let Err(e) = self.handle_event(&network, &event).await {
                warn!(
                    "Failed to apply {} of {} (revision {}): {}",
                    event.kind, event.key, event.revision, e
                );
            }
        }
        debug!("Endpoint stream of network {} closed", network.id);
    }

    /// Apply one endpoint mutation to the local neighbor tables.
    pub async fn handle_event(&self, network: &Network, event: &WatchEvent) -> Result<()> {
        let manager = self.registry.for_network(network)?;
        match event.kind {
            EventKind::Put => {
                let endpoint: Endpoint = serde_json::from_slice(&event.value)?;
                if endpoint.active {
                    manager.add_endpoint_neigh(network, &endpoint).await
                } else {
                    manager.remove_endpoint_neigh(network, &endpoint).await
                }
            }
            EventKind::Delete => {
                // Deletes carry no value; read it back from just before.
                let endpoint: Endpoint =
                    store::get_json_at_revision(&*self.store, &event.key, event.revision - 1)
                        .await?;
                manager.remove_endpoint_neigh(network, &endpoint).await
            }
        }
    }

    fn lock_drains(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.drains.lock().unwrap_or_else(|e| e.into_inner())
    }
}
