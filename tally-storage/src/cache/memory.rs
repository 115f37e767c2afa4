//! In-process cache substrate.
//!
//! Backs tests and single-process deployments. Every primitive goes through
//! DashMap's entry API, so `add`, `increment` and `pull` are atomic with
//! respect to each other exactly as a shared substrate's would be.
//!
//! Entry lifetimes are measured on the Tokio clock, which lets tests drive
//! expiry with a paused runtime. Lock leases use wall-clock timestamps since
//! they travel inside [`LockData`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tally_core::{check_held, Acquired, CacheError, Lock, LockData, TallyResult};
use tokio::time::Instant;
use uuid::Uuid;

use super::traits::{CacheStore, CacheValue};

#[derive(Debug, Clone)]
struct StoredEntry {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(value: CacheValue, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// DashMap-backed [`CacheStore`].
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<String, StoredEntry>,
    locks: DashMap<String, LockData>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently holding a live value, sorted. Test and debugging aid.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_live(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Keys under `prefix` holding a live value, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect()
    }

    /// Whether the named lock is currently held by anyone.
    pub fn is_locked(&self, name: &str) -> bool {
        let now = Utc::now();
        self.locks
            .get(name)
            .map_or(false, |held| !held.is_expired(now))
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn has(&self, key: &str) -> TallyResult<bool> {
        let now = Instant::now();
        Ok(self.entries.get(key).map_or(false, |e| e.is_live(now)))
    }

    async fn get(&self, key: &str) -> TallyResult<Option<CacheValue>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> TallyResult<()> {
        self.entries
            .insert(key.to_string(), StoredEntry::new(value, ttl));
        Ok(())
    }

    async fn add(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> TallyResult<bool> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(StoredEntry::new(value, ttl));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn increment(&self, key: &str, delta: i64) -> TallyResult<Option<i64>> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Vacant(_) => Ok(None),
            Entry::Occupied(occupied) if !occupied.get().is_live(now) => {
                occupied.remove();
                Ok(None)
            }
            Entry::Occupied(mut occupied) => {
                let current = match occupied.get().value {
                    CacheValue::Counter(v) => v,
                    CacheValue::Text(_) => {
                        return Err(CacheError::NotACounter {
                            key: key.to_string(),
                        }
                        .into())
                    }
                };
                let next = current.checked_add(delta).ok_or_else(|| CacheError::Substrate {
                    reason: format!("counter {} overflows adding {}", key, delta),
                })?;
                occupied.get_mut().value = CacheValue::Counter(next);
                Ok(Some(next))
            }
        }
    }

    async fn pull(&self, key: &str) -> TallyResult<Option<CacheValue>> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, entry)| entry)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value))
    }

    async fn forget(&self, key: &str) -> TallyResult<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map_or(false, |(_, entry)| entry.is_live(now)))
    }

    async fn forget_prefix(&self, prefix: &str) -> TallyResult<u64> {
        let now = Instant::now();
        let mut removed = 0u64;
        self.entries.retain(|key, entry| {
            if key.starts_with(prefix) {
                if entry.is_live(now) {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn try_acquire_lock(
        &self,
        name: &str,
        owner: Uuid,
        lease: Duration,
    ) -> TallyResult<Option<Lock<Acquired>>> {
        let now = Utc::now();
        let data = LockData::new(name, owner, now, lease);
        match self.locks.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    return Ok(None);
                }
                occupied.insert(data.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(data.clone());
            }
        }
        Ok(Some(Lock::new(data)))
    }

    async fn release_lock(&self, lock: LockData) -> TallyResult<bool> {
        let now = Utc::now();
        let removed = self
            .locks
            .remove_if(&lock.name, |_, held| check_held(held, lock.owner, now).is_ok());
        Ok(removed.is_some())
    }

    async fn extend_lock(
        &self,
        lock: Lock<Acquired>,
        additional: Duration,
    ) -> TallyResult<Option<Lock<Acquired>>> {
        let now = Utc::now();
        let Some(mut held) = self.locks.get_mut(lock.name()) else {
            return Ok(None);
        };
        if check_held(&held, lock.owner(), now).is_err() {
            return Ok(None);
        }
        let extended = lock.extend(additional);
        *held = extended.data().clone();
        Ok(Some(extended))
    }
}
