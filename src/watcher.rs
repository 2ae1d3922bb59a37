//! Watch registrations.
//!
//! A registration owns one store watch on a key prefix and forwards its
//! events into a channel handed to the registrant. Unregistering (or
//! shutting the watcher down) aborts the forwarder, which drops both ends
//! it holds: the registrant's channel closes and the store watch is
//! released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::store::{Store, WatchStream, WATCH_CHANNEL_CAPACITY};

struct Registration {
    forwarder: JoinHandle<()>,
}

pub struct Watcher {
    store: Arc<dyn Store>,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl Watcher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching `prefix`. Returns `None` if the prefix already has a
    /// live registration.
    pub async fn register(&self, prefix: &str) -> Result<Option<WatchStream>> {
        if self.is_registered(prefix) {
            return Ok(None);
        }

        let mut source = self.store.watch(prefix).await?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

        let mut registrations = self.lock_registrations();
        // Lost a race with a concurrent register of the same prefix.
        if registrations.contains_key(prefix) {
            return Ok(None);
        }
        let forwarder = tokio::spawn(async move {
            while let Some(event) = source.recv().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        registrations.insert(prefix.to_string(), Registration { forwarder });
        info!("Registered watch on {}", prefix);
        Ok(Some(rx))
    }

    /// Drop the registration for `prefix`, closing its channel. Returns
    /// false when nothing was registered.
    pub fn unregister(&self, prefix: &str) -> bool {
        let registration = self.lock_registrations().remove(prefix);
        match registration {
            Some(registration) => {
                registration.forwarder.abort();
                info!("Unregistered watch on {}", prefix);
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, prefix: &str) -> bool {
        self.lock_registrations().contains_key(prefix)
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.lock_registrations().keys().cloned().collect()
    }

    /// Close every registration.
    pub fn shutdown(&self) {
        let drained: Vec<(String, Registration)> = self.lock_registrations().drain().collect();
        for (prefix, registration) in drained {
            registration.forwarder.abort();
            debug!("Closed watch on {}", prefix);
        }
    }

    fn lock_registrations(&self) -> std::sync::MutexGuard<'_, HashMap<String, Registration>> {
        self.registrations.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::EventKind;

    #[tokio::test]
    async fn test_register_is_idempotent_per_prefix() {
        let store = Arc::new(MemoryStore::new());
        let watcher = Watcher::new(store.clone());

        let first = watcher.register("/p/").await.unwrap();
        assert!(first.is_some());
        let second = watcher.register("/p/").await.unwrap();
        assert!(second.is_none());
        assert_eq!(watcher.prefixes(), vec!["/p/".to_string()]);
    }

    #[tokio::test]
    async fn test_events_flow_until_unregister_closes_channel() {
        let store = Arc::new(MemoryStore::new());
        let watcher = Watcher::new(store.clone());
        let mut rx = watcher.register("/p/").await.unwrap().unwrap();

        store.set("/p/a", b"1".to_vec()).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Put);
        assert_eq!(event.key, "/p/a");

        assert!(watcher.unregister("/p/"));
        assert!(rx.recv().await.is_none());
        assert!(!watcher.unregister("/p/"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_registrations() {
        let store = Arc::new(MemoryStore::new());
        let watcher = Watcher::new(store);
        let mut a = watcher.register("/a/").await.unwrap().unwrap();
        let mut b = watcher.register("/b/").await.unwrap().unwrap();

        watcher.shutdown();
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert!(watcher.prefixes().is_empty());
    }
}
