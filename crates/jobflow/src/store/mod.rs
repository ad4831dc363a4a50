//! Narrow contract over the durable key-value store.
//!
//! Everything the queue needs from persistence goes through [`Store`]: versioned
//! values with optional TTL, FIFO lists used as the queue transport, and a scored
//! index used as lease bookkeeping. All cross-worker coordination is expressed as
//! conditional writes against it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Injected store handle shared by dispatcher, queue, workers and readers.
pub type StoreHandle = Arc<dyn Store>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: String,
    /// Starts at 1 on creation and grows by one per write.
    pub version: u64,
}

/// Index placement applied atomically with a pop.
#[derive(Debug, Clone, Copy)]
pub struct Park<'a> {
    pub index: &'a str,
    pub score: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Unconditional write. Returns the new version.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StoreError>;

    /// Absent and expired keys are both `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Writes only when the current version equals `expected`; `expected == 0`
    /// means the key must be absent. Returns `Ok(None)` on mismatch.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: u64,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<u64>, StoreError>;

    async fn list_push(&self, list: &str, value: &str) -> Result<(), StoreError>;

    /// Pops the head of `list`, waiting up to `timeout`. When `park` is given the
    /// popped value is inserted into that index in the same atomic step.
    async fn blocking_pop(
        &self,
        list: &str,
        timeout: Duration,
        park: Option<Park<'_>>,
    ) -> Result<Option<String>, StoreError>;

    async fn list_len(&self, list: &str) -> Result<u64, StoreError>;

    /// Inserts or re-scores `member`.
    async fn index_set(&self, index: &str, member: &str, score: i64) -> Result<(), StoreError>;

    async fn index_remove(&self, index: &str, member: &str) -> Result<bool, StoreError>;

    /// Members with `score <= max_score`, lowest score first.
    async fn index_range(
        &self,
        index: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;
}

/// Current unix time in milliseconds, the unit used for index scores.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
