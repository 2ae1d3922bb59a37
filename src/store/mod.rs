//! Store/Watch gateway.
//!
//! The rest of the agent only talks to the distributed store through the
//! [`Store`] trait: point and prefix reads (optionally pinned to a past
//! revision), writes, deletes, prefix watches and a cluster-wide lock.
//! Records are JSON; the typed helpers below do the (de)serialisation.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::types::WatchEvent;

pub mod etcd;
pub mod keys;
pub mod memory;

pub use etcd::EtcdStore;
pub use keys::Keys;
pub use memory::MemoryStore;

/// Events under a watched prefix, in revision order. The stream survives
/// transport reconnects; it ends only when the receiver is dropped.
pub type WatchStream = mpsc::Receiver<WatchEvent>;

/// Capacity of the channel behind every [`WatchStream`].
pub(crate) const WATCH_CHANNEL_CAPACITY: usize = 256;

/// A stored key with its value and last modification revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: i64,
}

/// Proof of a held cluster-wide lock; hand it back to [`Store::unlock`].
#[derive(Debug)]
pub struct StoreLock {
    pub name: String,
    pub(crate) key: Vec<u8>,
    pub(crate) lease: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Read `key`, or every key under it when `recursive`.
    /// Fails with [`Error::NotFound`] when nothing matches.
    async fn get(&self, key: &str, recursive: bool) -> Result<Vec<KeyValue>>;

    /// Like [`Store::get`], as the store was at `revision`.
    async fn get_with_revision(
        &self,
        key: &str,
        revision: i64,
        recursive: bool,
    ) -> Result<Vec<KeyValue>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Stream every mutation under `prefix`.
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;

    /// Acquire the named lock, waiting at most `wait`. The lock expires
    /// after `ttl` if the holder dies.
    async fn lock(&self, name: &str, ttl: Duration, wait: Duration) -> Result<StoreLock>;

    async fn unlock(&self, lock: StoreLock) -> Result<()>;
}

pub async fn get_json<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<T> {
    let kvs = store.get(key, false).await?;
    let kv = kvs
        .into_iter()
        .next()
        .ok_or_else(|| Error::NotFound(key.to_string()))?;
    Ok(serde_json::from_slice(&kv.value)?)
}

pub async fn get_json_at_revision<T: DeserializeOwned>(
    store: &dyn Store,
    key: &str,
    revision: i64,
) -> Result<T> {
    let kvs = store.get_with_revision(key, revision, false).await?;
    let kv = kvs
        .into_iter()
        .next()
        .ok_or_else(|| Error::NotFound(format!("{}@{}", key, revision)))?;
    Ok(serde_json::from_slice(&kv.value)?)
}

/// Decode every record under `prefix`. An empty prefix yields an empty list.
pub async fn list_json<T: DeserializeOwned>(store: &dyn Store, prefix: &str) -> Result<Vec<T>> {
    let kvs = match store.get(prefix, true).await {
        Ok(kvs) => kvs,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    kvs.iter()
        .map(|kv| serde_json::from_slice(&kv.value).map_err(Error::from))
        .collect()
}

pub async fn put_json<T: Serialize + Sync>(store: &dyn Store, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, bytes).await
}

/// Delete `key`, treating an already-missing key as success.
pub async fn delete_if_exists(store: &dyn Store, key: &str) -> Result<()> {
    match store.delete(key).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
