//! Cache substrate traits.
//!
//! The substrate is the shared key-value store every process talks to
//! (Redis, Memcached, or the in-memory implementation for tests). It is the
//! single source of truth for uncommitted counter state.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tally_core::{Acquired, CacheError, Lock, LockData, TallyResult};
use uuid::Uuid;

/// A value held by the substrate.
///
/// Counters carry scaled field values; text carries version tokens and
/// scheduling markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Counter(i64),
    Text(String),
}

impl CacheValue {
    pub fn as_counter(&self) -> Option<i64> {
        match self {
            CacheValue::Counter(v) => Some(*v),
            CacheValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CacheValue::Text(s) => Some(s),
            CacheValue::Counter(_) => None,
        }
    }
}

impl From<i64> for CacheValue {
    fn from(v: i64) -> Self {
        CacheValue::Counter(v)
    }
}

impl From<String> for CacheValue {
    fn from(v: String) -> Self {
        CacheValue::Text(v)
    }
}

impl From<&str> for CacheValue {
    fn from(v: &str) -> Self {
        CacheValue::Text(v.to_string())
    }
}

/// Key-value substrate with atomic counters and named locks.
///
/// Implementations must be safe to share between tasks and processes. A
/// `ttl` of `None` stores the value until it is explicitly removed.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Whether a live value exists at `key`.
    async fn has(&self, key: &str) -> TallyResult<bool>;

    async fn get(&self, key: &str) -> TallyResult<Option<CacheValue>>;

    /// Store `value`, replacing whatever was there.
    async fn put(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> TallyResult<()>;

    /// Store `value` only if no live value exists. Returns whether it was stored.
    ///
    /// This is the atomic primitive behind first-population and marker
    /// creation; two concurrent callers can never both see `true`.
    async fn add(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> TallyResult<bool>;

    /// Atomically add `delta` to the counter at `key`, returning the new value.
    ///
    /// Returns `None` when the key is absent. A drained counter is never
    /// recreated from zero, since that would silently drop the base value.
    async fn increment(&self, key: &str, delta: i64) -> TallyResult<Option<i64>>;

    /// Atomically subtract `delta`. See [`CacheStore::increment`].
    async fn decrement(&self, key: &str, delta: i64) -> TallyResult<Option<i64>> {
        let negated = delta.checked_neg().ok_or_else(|| CacheError::Substrate {
            reason: format!("decrement of {} by {} overflows", key, delta),
        })?;
        self.increment(key, negated).await
    }

    /// Atomically read and remove the value at `key`.
    async fn pull(&self, key: &str) -> TallyResult<Option<CacheValue>>;

    /// Remove `key`. Returns whether a value was removed.
    async fn forget(&self, key: &str) -> TallyResult<bool>;

    /// Remove every key starting with `prefix`. Returns the number removed.
    async fn forget_prefix(&self, prefix: &str) -> TallyResult<u64>;

    /// Try once to take the named lock for `owner` with the given lease.
    async fn try_acquire_lock(
        &self,
        name: &str,
        owner: Uuid,
        lease: Duration,
    ) -> TallyResult<Option<Lock<Acquired>>>;

    /// Release a lock previously granted. Returns `false` if the lock had
    /// already expired or passed to another owner.
    async fn release_lock(&self, lock: LockData) -> TallyResult<bool>;

    /// Push a held lock's expiry out by `additional`. `Ok(None)` when the
    /// lease already ran out or the lock passed to another owner.
    async fn extend_lock(
        &self,
        lock: Lock<Acquired>,
        additional: Duration,
    ) -> TallyResult<Option<Lock<Acquired>>>;
}

/// Helpers layered on the substrate primitives.
#[async_trait]
pub trait CacheStoreExt: CacheStore {
    /// Read a counter; `Ok(None)` when absent, an error when the key holds text.
    async fn get_counter(&self, key: &str) -> TallyResult<Option<i64>> {
        match self.get(key).await? {
            None => Ok(None),
            Some(CacheValue::Counter(v)) => Ok(Some(v)),
            Some(CacheValue::Text(_)) => Err(CacheError::NotACounter {
                key: key.to_string(),
            }
            .into()),
        }
    }

    /// Read a text value; counters read as `None`.
    async fn get_text(&self, key: &str) -> TallyResult<Option<String>> {
        Ok(self
            .get(key)
            .await?
            .and_then(|v| v.as_text().map(str::to_string)))
    }

    /// Get the value at `key`, or compute and store it forever.
    ///
    /// Race-free: if two callers compute concurrently, the first `add` wins
    /// and both return the stored value.
    async fn remember_forever<F, Fut>(&self, key: &str, producer: F) -> TallyResult<CacheValue>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = TallyResult<CacheValue>> + Send,
    {
        if let Some(existing) = self.get(key).await? {
            return Ok(existing);
        }
        let produced = producer().await?;
        if self.add(key, produced.clone(), None).await? {
            return Ok(produced);
        }
        Ok(self.get(key).await?.unwrap_or(produced))
    }
}

impl<T: CacheStore + ?Sized> CacheStoreExt for T {}
