// crates/jobflow/src/jobs/repo.rs

use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::jobs::model::JobRecord;
use crate::store::StoreHandle;

/// A record together with the store version it was read at.
#[derive(Debug, Clone)]
pub struct StoredJob {
    pub record: JobRecord,
    pub version: u64,
}

/// Job records as versioned JSON documents in the store, plus the key layout
/// shared by queue lists and lease indexes.
#[derive(Clone)]
pub struct JobsRepo {
    store: StoreHandle,
    namespace: String,
}

impl JobsRepo {
    pub fn new(store: StoreHandle, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    // ----------------------------
    // Key layout
    // ----------------------------

    pub fn record_key(&self, id: Uuid) -> String {
        format!("{}:job:{}", self.namespace, id)
    }

    pub fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.namespace, queue)
    }

    pub fn lease_index_key(&self, queue: &str) -> String {
        format!("{}:leases:{}", self.namespace, queue)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get_job(&self, id: Uuid) -> Result<Option<StoredJob>> {
        let key = self.record_key(id);
        let Some(entry) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let record: JobRecord =
            serde_json::from_str(&entry.value).map_err(|source| Error::Codec { key, source })?;
        Ok(Some(StoredJob {
            record,
            version: entry.version,
        }))
    }

    // ----------------------------
    // Writes
    // ----------------------------

    /// Create-if-absent. Returns the new version, or `None` when the id is taken.
    pub async fn insert(&self, record: &JobRecord) -> Result<Option<u64>> {
        let key = self.record_key(record.id);
        let value = encode(&key, record)?;
        Ok(self.store.compare_and_set(&key, 0, &value, None).await?)
    }

    /// Conditional write at `expected` version. `None` means someone else wrote first.
    pub async fn update(
        &self,
        record: &JobRecord,
        expected: u64,
        ttl: Option<Duration>,
    ) -> Result<Option<u64>> {
        let key = self.record_key(record.id);
        let value = encode(&key, record)?;
        Ok(self
            .store
            .compare_and_set(&key, expected, &value, ttl)
            .await?)
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.store.delete(&self.record_key(id)).await?)
    }
}

fn encode(key: &str, record: &JobRecord) -> Result<String> {
    serde_json::to_string(record).map_err(|source| Error::Codec {
        key: key.to_string(),
        source,
    })
}
