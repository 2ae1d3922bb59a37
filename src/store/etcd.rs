//! etcd v3 backend.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LockOptions, WatchOptions,
};
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::sleep;

use super::{KeyValue, Store, StoreLock, WatchStream, WATCH_CHANNEL_CAPACITY};
use crate::error::{Error, Result};
use crate::types::{EventKind, WatchEvent};

/// Pause before re-entering a watch the transport dropped.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String], request_timeout: Duration) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(request_timeout)
            .with_timeout(request_timeout);
        let client = Client::connect(endpoints, Some(options)).await?;
        info!("Connected to etcd at {:?}", endpoints);
        Ok(Self { client })
    }

    fn get_options(revision: Option<i64>, recursive: bool) -> Option<GetOptions> {
        if revision.is_none() && !recursive {
            return None;
        }
        let mut options = GetOptions::new();
        if recursive {
            options = options.with_prefix();
        }
        if let Some(revision) = revision {
            options = options.with_revision(revision);
        }
        Some(options)
    }

    async fn read(&self, key: &str, revision: Option<i64>, recursive: bool) -> Result<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client
            .get(key, Self::get_options(revision, recursive))
            .await
            .map_err(|e| Error::Store(format!("get {}: {}", key, e)))?;
        if resp.kvs().is_empty() {
            return Err(Error::NotFound(key.to_string()));
        }
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
                mod_revision: kv.mod_revision(),
            })
            .collect())
    }

    async fn current_revision(&self, prefix: &str) -> Result<i64> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix().with_count_only()))
            .await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or(0))
    }
}

/// One response off a watch stream.
#[derive(Debug)]
pub(crate) enum WatchBatch {
    Events(Vec<WatchEvent>),
    /// The server ended the watch, e.g. because `compact_revision`
    /// overtook the requested start.
    Canceled { compact_revision: i64 },
}

/// Opens watches; the reconnect loop in [`run_watch`] sits on top.
#[async_trait]
pub(crate) trait WatchSource: Send + 'static {
    type Session: WatchSession;

    async fn open(&mut self, prefix: &str, start_revision: i64) -> Result<Self::Session>;
}

#[async_trait]
pub(crate) trait WatchSession: Send {
    /// `None` once the transport closed the stream.
    async fn next(&mut self) -> Option<Result<WatchBatch>>;

    async fn cancel(&mut self);
}

struct EtcdWatchSource {
    client: Client,
}

struct EtcdWatchSession {
    watcher: etcd_client::Watcher,
    stream: etcd_client::WatchStream,
}

#[async_trait]
impl WatchSource for EtcdWatchSource {
    type Session = EtcdWatchSession;

    async fn open(&mut self, prefix: &str, start_revision: i64) -> Result<EtcdWatchSession> {
        let mut options = WatchOptions::new().with_prefix();
        if start_revision > 0 {
            options = options.with_start_revision(start_revision);
        }
        let (watcher, stream) = self.client.watch(prefix, Some(options)).await?;
        Ok(EtcdWatchSession { watcher, stream })
    }
}

#[async_trait]
impl WatchSession for EtcdWatchSession {
    async fn next(&mut self) -> Option<Result<WatchBatch>> {
        let resp = match self.stream.next().await? {
            Ok(resp) => resp,
            Err(e) => return Some(Err(e.into())),
        };
        if resp.canceled() {
            return Some(Ok(WatchBatch::Canceled {
                compact_revision: resp.compact_revision(),
            }));
        }
        let events = resp
            .events()
            .iter()
            .filter_map(|event| {
                let kv = event.kv()?;
                let (kind, value) = match event.event_type() {
                    EventType::Put => (EventKind::Put, kv.value().to_vec()),
                    EventType::Delete => (EventKind::Delete, Vec::new()),
                };
                Some(WatchEvent {
                    kind,
                    key: String::from_utf8_lossy(kv.key()).into_owned(),
                    value,
                    revision: kv.mod_revision(),
                })
            })
            .collect();
        Some(Ok(WatchBatch::Events(events)))
    }

    async fn cancel(&mut self) {
        if let Err(e) = self.watcher.cancel().await {
            debug!("Cancel of watch failed: {}", e);
        }
    }
}

/// Forward watch batches for `prefix` into `tx`, re-entering the watch
/// from the next unseen revision whenever the transport cancels or drops
/// it. Returns once the receiving side is gone.
pub(crate) async fn run_watch<S: WatchSource>(
    mut source: S,
    prefix: String,
    mut next_revision: i64,
    tx: mpsc::Sender<WatchEvent>,
    retry_delay: Duration,
) {
    loop {
        if tx.is_closed() {
            return;
        }

        let mut session = match source.open(&prefix, next_revision).await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to watch {}: {}. Retrying in {:?}...", prefix, e, retry_delay);
                sleep(retry_delay).await;
                continue;
            }
        };
        debug!("Watch on {} started at revision {}", prefix, next_revision);

        loop {
            let msg = tokio::select! {
                _ = tx.closed() => None,
                msg = session.next() => Some(msg),
            };
            let Some(msg) = msg else {
                session.cancel().await;
                debug!("Watch on {} released", prefix);
                return;
            };

            match msg {
                Some(Ok(WatchBatch::Events(events))) => {
                    for event in events {
                        next_revision = event.revision + 1;
                        if tx.send(event).await.is_err() {
                            session.cancel().await;
                            return;
                        }
                    }
                }
                Some(Ok(WatchBatch::Canceled { compact_revision })) => {
                    if compact_revision > next_revision {
                        warn!(
                            "Watch on {} fell behind compaction, resuming at {}",
                            prefix, compact_revision
                        );
                        next_revision = compact_revision;
                    }
                    warn!("Watch on {} canceled by the server, re-entering", prefix);
                    break;
                }
                Some(Err(e)) => {
                    warn!("Watch on {} interrupted: {}", prefix, e);
                    break;
                }
                None => {
                    warn!("Watch stream on {} ended", prefix);
                    break;
                }
            }
        }

        sleep(retry_delay).await;
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn get(&self, key: &str, recursive: bool) -> Result<Vec<KeyValue>> {
        self.read(key, None, recursive).await
    }

    async fn get_with_revision(
        &self,
        key: &str,
        revision: i64,
        recursive: bool,
    ) -> Result<Vec<KeyValue>> {
        self.read(key, Some(revision), recursive).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(key, value, None)
            .await
            .map_err(|e| Error::Store(format!("put {}: {}", key, e)))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        let resp = client
            .delete(key, None)
            .await
            .map_err(|e| Error::Store(format!("delete {}: {}", key, e)))?;
        if resp.deleted() == 0 {
            return Err(Error::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let start = self.current_revision(prefix).await? + 1;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let source = EtcdWatchSource {
            client: self.client.clone(),
        };
        tokio::spawn(run_watch(source, prefix.to_string(), start, tx, RECONNECT_DELAY));
        Ok(rx)
    }

    async fn lock(&self, name: &str, ttl: Duration, wait: Duration) -> Result<StoreLock> {
        let mut client = self.client.clone();
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let lease = client.lease_grant(ttl_secs, None).await?.id();

        let options = LockOptions::new().with_lease(lease);
        let result = tokio::time::timeout(wait, client.lock(name, Some(options))).await;
        match result {
            Ok(Ok(resp)) => Ok(StoreLock {
                name: name.to_string(),
                key: resp.key().to_vec(),
                lease,
            }),
            Ok(Err(e)) => {
                let _ = client.lease_revoke(lease).await;
                Err(Error::Store(format!("lock {}: {}", name, e)))
            }
            Err(_) => {
                let _ = client.lease_revoke(lease).await;
                Err(Error::Timeout(format!("waiting for lock {}", name)))
            }
        }
    }

    async fn unlock(&self, lock: StoreLock) -> Result<()> {
        let mut client = self.client.clone();
        client
            .unlock(lock.key)
            .await
            .map_err(|e| Error::Store(format!("unlock {}: {}", lock.name, e)))?;
        if let Err(e) = client.lease_revoke(lock.lease).await {
            warn!("Failed to revoke lease of lock {}: {}", lock.name, e);
        }
        Ok(())
    }
}
