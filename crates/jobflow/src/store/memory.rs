use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

use super::{Entry, Park, Store};
use crate::error::StoreError;

#[derive(Debug)]
struct MemEntry {
    value: String,
    version: u64,
    expires_at: Option<Instant>,
}

impl MemEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, MemEntry>,
    lists: HashMap<String, VecDeque<String>>,
    indexes: HashMap<String, HashMap<String, i64>>,
}

/// In-process store for tests and single-process embedding.
///
/// Fault injection (`fail_next`, `set_offline`) makes operations return
/// `StoreError::Unavailable` so retry paths can be exercised.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pushed: Notify,
    fail_next: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` operations fail with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

fn expiry(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|d| Instant::now() + d)
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let version = match inner.entries.get(key) {
            Some(e) if e.is_live(now) => e.version + 1,
            _ => 1,
        };
        inner.entries.insert(
            key.to_string(),
            MemEntry {
                value: value.to_string(),
                version,
                expires_at: expiry(ttl),
            },
        );
        Ok(version)
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let found = inner.entries.get(key).map(|e| {
            (
                e.is_live(now),
                Entry {
                    value: e.value.clone(),
                    version: e.version,
                },
            )
        });
        match found {
            Some((true, entry)) => Ok(Some(entry)),
            Some((false, _)) => {
                inner.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Ok(inner
            .entries
            .remove(key)
            .map_or(false, |e| e.is_live(now)))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: u64,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<u64>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let current = inner
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map_or(0, |e| e.version);
        if current != expected {
            return Ok(None);
        }
        let version = current + 1;
        inner.entries.insert(
            key.to_string(),
            MemEntry {
                value: value.to_string(),
                version,
                expires_at: expiry(ttl),
            },
        );
        Ok(Some(version))
    }

    async fn list_push(&self, list: &str, value: &str) -> Result<(), StoreError> {
        self.check_available()?;
        {
            let mut inner = self.inner.lock().await;
            inner
                .lists
                .entry(list.to_string())
                .or_default()
                .push_back(value.to_string());
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(
        &self,
        list: &str,
        timeout: Duration,
        park: Option<Park<'_>>,
    ) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before looking so a concurrent push cannot be missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                let popped = inner.lists.get_mut(list).and_then(|q| q.pop_front());
                if let Some(value) = popped {
                    if let Some(park) = park {
                        inner
                            .indexes
                            .entry(park.index.to_string())
                            .or_default()
                            .insert(value.clone(), park.score);
                    }
                    return Ok(Some(value));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn list_len(&self, list: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.lists.get(list).map_or(0, |q| q.len() as u64))
    }

    async fn index_set(&self, index: &str, member: &str, score: i64) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner
            .indexes
            .entry(index.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn index_remove(&self, index: &str, member: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        Ok(inner
            .indexes
            .get_mut(index)
            .map_or(false, |m| m.remove(member).is_some()))
    }

    async fn index_range(
        &self,
        index: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let Some(members) = inner.indexes.get(index) else {
            return Ok(Vec::new());
        };
        let mut due: Vec<(&String, i64)> = members
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .map(|(m, s)| (m, *s))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(due.into_iter().take(limit).map(|(m, _)| m.clone()).collect())
    }
}
