//! Blocking named locks on top of the cache substrate.
//!
//! `DistributedLock` polls [`CacheStore::try_acquire_lock`] until the lock is
//! granted or the configured wait runs out. Each instance carries its own
//! owner token, so only the instance that acquired a lock can release it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tally_core::{Acquired, CacheError, Lock, TallyConfig, TallyResult};
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::CacheStore;

/// Named mutual exclusion with bounded wait.
#[derive(Clone)]
pub struct DistributedLock {
    cache: Arc<dyn CacheStore>,
    name: String,
    owner: Uuid,
    wait: Duration,
    lease: Duration,
    poll_interval: Duration,
}

impl DistributedLock {
    pub fn new(cache: Arc<dyn CacheStore>, name: impl Into<String>, config: &TallyConfig) -> Self {
        Self {
            cache,
            name: name.into(),
            owner: Uuid::now_v7(),
            wait: config.lock_wait,
            lease: config.lock_lease,
            poll_interval: config.lock_poll_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Single attempt, no waiting.
    pub async fn try_acquire(&self) -> TallyResult<Option<Lock<Acquired>>> {
        self.cache
            .try_acquire_lock(&self.name, self.owner, self.lease)
            .await
    }

    /// Acquire, waiting up to the configured bound.
    ///
    /// # Errors
    ///
    /// `LockTimeout` if the lock is still held elsewhere when the wait ends.
    pub async fn acquire(&self) -> TallyResult<Lock<Acquired>> {
        let started = Instant::now();
        let deadline = started + self.wait;
        loop {
            if let Some(lock) = self.try_acquire().await? {
                return Ok(lock);
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(lock = %self.name, "Lock wait expired");
                return Err(CacheError::LockTimeout {
                    name: self.name.clone(),
                    waited_ms: (now - started).as_millis() as u64,
                }
                .into());
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Release a held lock. Returns `false` if the lease had already expired.
    pub async fn release(&self, lock: Lock<Acquired>) -> TallyResult<bool> {
        let released = self.cache.release_lock(lock.release()).await?;
        if !released {
            tracing::warn!(lock = %self.name, "Lock lease expired before release");
        }
        Ok(released)
    }

    /// Push the lease of a held lock out by `additional`.
    ///
    /// # Errors
    ///
    /// `LockLost` if the lease already ran out; another holder may own the
    /// lock by now.
    pub async fn extend(
        &self,
        lock: Lock<Acquired>,
        additional: Duration,
    ) -> TallyResult<Lock<Acquired>> {
        match self.cache.extend_lock(lock, additional).await? {
            Some(extended) => Ok(extended),
            None => {
                tracing::warn!(lock = %self.name, "Lock lease lost before extension");
                Err(CacheError::LockLost {
                    name: self.name.clone(),
                }
                .into())
            }
        }
    }

    /// Run `f` while holding the lock.
    ///
    /// The lock is released whether `f` succeeds or fails; `f`'s result is
    /// returned unchanged.
    pub async fn block<F, Fut, T>(&self, f: F) -> TallyResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TallyResult<T>>,
    {
        let lock = self.acquire().await?;
        let result = f().await;
        if let Err(e) = self.release(lock).await {
            tracing::warn!(lock = %self.name, error = %e, "Failed to release lock");
        }
        result
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("wait", &self.wait)
            .field("lease", &self.lease)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStore;

    fn config() -> TallyConfig {
        TallyConfig::default()
            .with_lock_wait(Duration::from_millis(200))
            .with_lock_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_block_releases_after_success_and_failure() {
        let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new());
        let lock = DistributedLock::new(cache.clone(), "l", &config());

        let value = lock.block(|| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);

        let failed: TallyResult<()> = lock
            .block(|| async {
                Err(CacheError::Substrate {
                    reason: "boom".to_string(),
                }
                .into())
            })
            .await;
        assert!(failed.is_err());

        let other = DistributedLock::new(cache, "l", &config());
        assert!(other.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_while_held() {
        let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new());
        let holder = DistributedLock::new(cache.clone(), "l", &config());
        let _held = holder.acquire().await.unwrap();

        let waiter = DistributedLock::new(cache, "l", &config());
        let err = waiter.acquire().await.unwrap_err();
        assert!(err.is_lock_timeout());
    }

    #[tokio::test]
    async fn test_extend_keeps_lock_until_released() {
        let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new());
        let lock = DistributedLock::new(cache.clone(), "l", &config());
        let held = lock.acquire().await.unwrap();
        let stale = held.clone();

        let extended = lock.extend(held, Duration::from_secs(60)).await.unwrap();
        assert!(extended.expires_at() > stale.expires_at());

        let other = DistributedLock::new(cache, "l", &config());
        assert!(other.try_acquire().await.unwrap().is_none());

        assert!(lock.release(extended).await.unwrap());
        let err = lock.extend(stale, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(
            err,
            tally_core::TallyError::Cache(CacheError::LockLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new());
        let holder = DistributedLock::new(cache.clone(), "l", &config());
        let held = holder.acquire().await.unwrap();

        let waiter = DistributedLock::new(cache, "l", &config());
        let pending = tokio::spawn(async move { waiter.acquire().await.map(|l| l.owner()) });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(holder.release(held).await.unwrap());
        assert!(pending.await.unwrap().is_ok());
    }
}
