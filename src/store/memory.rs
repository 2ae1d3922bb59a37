//! Process-local revisioned store.
//!
//! Keeps recent mutations in a history log so revision-pinned reads behave
//! like etcd's, delivers prefix watches in revision order and implements
//! the named lock with a [`Notify`]. Used for single-node deployments and
//! throughout the test suite.
//!
//! History older than the retention window is folded into a base
//! snapshot, as an etcd compaction would; reads pinned before it fail.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use super::{KeyValue, Store, StoreLock, WatchStream, WATCH_CHANNEL_CAPACITY};
use crate::error::{Error, Result};
use crate::types::{EventKind, WatchEvent};

/// Revisions kept in the history log by default.
pub const DEFAULT_HISTORY_RETENTION: usize = 10_000;

struct Inner {
    revision: i64,
    data: BTreeMap<String, KeyValue>,
    /// State as of `compacted`, the newest revision folded out of `history`.
    base: BTreeMap<String, KeyValue>,
    compacted: i64,
    /// `(revision, key, value)`; `None` records a delete.
    history: VecDeque<(i64, String, Option<Vec<u8>>)>,
    retention: usize,
    /// Unbounded so a slow registrant never costs an event; each queue is
    /// moved into the registrant's stream by its own forwarder task.
    watchers: Vec<(String, mpsc::UnboundedSender<WatchEvent>)>,
    locks: HashMap<String, i64>,
    next_lease: i64,
}

impl Inner {
    fn new(retention: usize) -> Self {
        Self {
            revision: 0,
            data: BTreeMap::new(),
            base: BTreeMap::new(),
            compacted: 0,
            history: VecDeque::new(),
            retention: retention.max(1),
            watchers: Vec::new(),
            locks: HashMap::new(),
            next_lease: 0,
        }
    }

    fn record(&mut self, revision: i64, key: &str, value: Option<Vec<u8>>) {
        self.history.push_back((revision, key.to_string(), value));
        // Fold in batches so compaction is amortised over many writes.
        if self.history.len() < self.retention * 2 {
            return;
        }
        while self.history.len() > self.retention {
            let Some((rev, key, value)) = self.history.pop_front() else {
                break;
            };
            match value {
                Some(value) => {
                    self.base.insert(
                        key.clone(),
                        KeyValue {
                            key,
                            value,
                            mod_revision: rev,
                        },
                    );
                }
                None => {
                    self.base.remove(&key);
                }
            }
            self.compacted = rev;
        }
        debug!("Compacted store history up to revision {}", self.compacted);
    }

    fn publish(&mut self, event: WatchEvent) {
        self.watchers.retain(|(prefix, tx)| {
            if !event.key.starts_with(prefix.as_str()) {
                return !tx.is_closed();
            }
            tx.send(event.clone()).is_ok()
        });
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    released: Notify,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_retention(DEFAULT_HISTORY_RETENTION)
    }

    /// Keep at least `retention` revisions readable through
    /// [`Store::get_with_revision`].
    pub fn with_history_retention(retention: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::new(retention)),
            released: Notify::new(),
        }
    }

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        self.lock_inner().revision
    }

    /// Oldest revision still readable.
    pub fn compacted_revision(&self) -> i64 {
        self.lock_inner().compacted
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the guard cannot leave Inner half-written.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_acquire(&self, name: &str) -> Option<StoreLock> {
        let mut inner = self.lock_inner();
        if inner.locks.contains_key(name) {
            return None;
        }
        inner.next_lease += 1;
        let lease = inner.next_lease;
        inner.locks.insert(name.to_string(), lease);
        Some(StoreLock {
            name: name.to_string(),
            key: format!("{}/{:x}", name, lease).into_bytes(),
            lease,
        })
    }
}

fn key_matches(candidate: &str, key: &str, recursive: bool) -> bool {
    if recursive {
        candidate.starts_with(key)
    } else {
        candidate == key
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str, recursive: bool) -> Result<Vec<KeyValue>> {
        let inner = self.lock_inner();
        let kvs: Vec<KeyValue> = if recursive {
            inner
                .data
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(_, kv)| kv.clone())
                .collect()
        } else {
            inner.data.get(key).cloned().into_iter().collect()
        };
        if kvs.is_empty() {
            return Err(Error::NotFound(key.to_string()));
        }
        Ok(kvs)
    }

    async fn get_with_revision(
        &self,
        key: &str,
        revision: i64,
        recursive: bool,
    ) -> Result<Vec<KeyValue>> {
        let inner = self.lock_inner();
        if revision > inner.revision {
            return Err(Error::Store(format!(
                "requested revision {} is newer than current revision {}",
                revision, inner.revision
            )));
        }
        if revision < inner.compacted {
            return Err(Error::Store(format!(
                "required revision {} has been compacted (oldest is {})",
                revision, inner.compacted
            )));
        }
        let mut view: BTreeMap<String, KeyValue> = inner
            .base
            .iter()
            .filter(|(k, _)| key_matches(k, key, recursive))
            .map(|(k, kv)| (k.clone(), kv.clone()))
            .collect();
        for (rev, k, value) in inner.history.iter().take_while(|(rev, _, _)| *rev <= revision) {
            if !key_matches(k, key, recursive) {
                continue;
            }
            match value {
                Some(value) => {
                    view.insert(
                        k.clone(),
                        KeyValue {
                            key: k.clone(),
                            value: value.clone(),
                            mod_revision: *rev,
                        },
                    );
                }
                None => {
                    view.remove(k);
                }
            }
        }
        if view.is_empty() {
            return Err(Error::NotFound(format!("{}@{}", key, revision)));
        }
        Ok(view.into_values().collect())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.lock_inner();
        inner.revision += 1;
        let revision = inner.revision;
        inner.record(revision, key, Some(value.clone()));
        inner.data.insert(
            key.to_string(),
            KeyValue {
                key: key.to_string(),
                value: value.clone(),
                mod_revision: revision,
            },
        );
        inner.publish(WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            value,
            revision,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.data.remove(key).is_none() {
            return Err(Error::NotFound(key.to_string()));
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner.record(revision, key, None);
        inner.publish(WatchEvent {
            kind: EventKind::Delete,
            key: key.to_string(),
            value: Vec::new(),
            revision,
        });
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        self.lock_inner().watchers.push((prefix.to_string(), queue_tx));
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = tx.closed() => break,
                    event = queue_rx.recv() => event,
                };
                let Some(event) = event else { break };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        debug!("Watching {}", prefix);
        Ok(rx)
    }

    async fn lock(&self, name: &str, _ttl: Duration, wait: Duration) -> Result<StoreLock> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lock) = self.try_acquire(name) {
                return Ok(lock);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout(format!("waiting for lock {}", name)));
            }
        }
    }

    async fn unlock(&self, lock: StoreLock) -> Result<()> {
        {
            let mut inner = self.lock_inner();
            if inner.locks.get(&lock.name) != Some(&lock.lease) {
                return Err(Error::NotFound(format!("lock {}", lock.name)));
            }
            inner.locks.remove(&lock.name);
        }
        self.released.notify_waiters();
        Ok(())
    }
}
