//! Sequential identifier allocation (VNIs).
//!
//! Nothing is stored for the counter itself: [`SequentialIdAllocator::generate`]
//! scans the records under a prefix, collects one integer field from each
//! and returns the smallest positive value not taken. Callers must hold
//! the allocator's lock from `generate` until the new record is written,
//! otherwise two callers can pick the same value.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::store::{self, Store, StoreLock};

pub struct SequentialIdAllocator {
    store: Arc<dyn Store>,
    /// Prefix holding the records that carry the sequenced field.
    prefix: String,
    field: String,
    lock_name: String,
    max: u32,
    lock_ttl: Duration,
    lock_wait: Duration,
}

impl SequentialIdAllocator {
    pub fn new(
        store: Arc<dyn Store>,
        prefix: impl Into<String>,
        field: impl Into<String>,
        lock_name: impl Into<String>,
        max: u32,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            field: field.into(),
            lock_name: lock_name.into(),
            max,
            lock_ttl: Duration::from_secs(30),
            lock_wait: Duration::from_secs(10),
        }
    }

    pub fn with_lock_timing(mut self, ttl: Duration, wait: Duration) -> Self {
        self.lock_ttl = ttl;
        self.lock_wait = wait;
        self
    }

    pub async fn lock(&self) -> Result<StoreLock> {
        self.store
            .lock(&self.lock_name, self.lock_ttl, self.lock_wait)
            .await
    }

    pub async fn unlock(&self, lock: StoreLock) -> Result<()> {
        self.store.unlock(lock).await
    }

    /// Smallest positive integer in `1..=max` not used by any record.
    pub async fn generate(&self) -> Result<u32> {
        let records: Vec<serde_json::Value> = store::list_json(&*self.store, &self.prefix).await?;
        let used: HashSet<u64> = records
            .iter()
            .filter_map(|record| record.get(&self.field).and_then(|v| v.as_u64()))
            .collect();

        let id = (1..=self.max)
            .find(|candidate| !used.contains(&(*candidate as u64)))
            .ok_or(Error::NoIdAvailable)?;
        debug!("Generated {} {} under {}", self.field, id, self.prefix);
        Ok(id)
    }
}
