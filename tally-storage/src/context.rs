//! Wiring for the cache: substrate, store, scheduler, registry and config.
//!
//! A `CacheContext` is built once at startup and cloned into every place
//! that needs a proxy. There is no global state; two contexts over separate
//! substrates never see each other.
//!
//! # Example
//!
//! ```ignore
//! let (ctx, scheduler) = CacheContext::builder(cache, store)
//!     .register_type("account", TypeSchema::new().cached("balance"))
//!     .config(TallyConfig::from_env())
//!     .build_tokio()?;
//!
//! let mut account = ctx.load("account", 42i64, false).await?.expect("exists");
//! account.increment("balance", 2.5, None).await?;
//!
//! // Before exit
//! scheduler.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tally_core::constants::MARKER_VALUE;
use tally_core::{
    new_version_token, FieldRegistry, FieldValue, RecordId, RecordKey, ScheduleWindow,
    TallyConfig, TallyResult, TypeSchema, TypeTag,
};

use crate::cache::{CacheStore, CacheStoreExt, CacheValue};
use crate::hooks;
use crate::jobs::{
    FlushJob, FlushMetrics, FlushOutcome, FlushWorker, JobScheduler, ManualScheduler,
    TokioJobScheduler,
};
use crate::lock::DistributedLock;
use crate::proxy::CacheProxy;
use crate::store::{BackingStore, Record};

struct ContextInner<S: BackingStore> {
    cache: Arc<dyn CacheStore>,
    store: Arc<S>,
    scheduler: Arc<dyn JobScheduler>,
    registry: Arc<FieldRegistry>,
    config: TallyConfig,
    metrics: Arc<FlushMetrics>,
}

/// Shared handle to everything a proxy needs.
pub struct CacheContext<S: BackingStore> {
    inner: Arc<ContextInner<S>>,
}

impl<S: BackingStore> Clone for CacheContext<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: BackingStore> CacheContext<S> {
    pub fn builder(cache: Arc<dyn CacheStore>, store: Arc<S>) -> CacheContextBuilder<S> {
        CacheContextBuilder {
            cache,
            store,
            registry: FieldRegistry::new(),
            config: TallyConfig::default(),
        }
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.inner.cache
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn scheduler(&self) -> &Arc<dyn JobScheduler> {
        &self.inner.scheduler
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &TallyConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<FlushMetrics> {
        &self.inner.metrics
    }

    /// Wrap a record the caller loaded itself.
    ///
    /// Nothing tells which version the record was read under, so the proxy
    /// starts without a token and re-reads the record at its first cold
    /// population.
    pub fn proxy(
        &self,
        record: S::Record,
        type_tag: impl Into<TypeTag>,
        batched: bool,
    ) -> CacheProxy<S> {
        let key = RecordKey::new(type_tag.into(), record.id());
        CacheProxy::new(self.clone(), record, key, batched, String::new())
    }

    /// Load a record from the store and wrap it. `Ok(None)` when absent.
    ///
    /// The version token is read before the record. A flush persisting in
    /// between then shows up as a token mismatch at population instead of
    /// a stale base value cached under the new token.
    pub async fn load(
        &self,
        type_tag: impl Into<TypeTag>,
        id: impl Into<RecordId>,
        batched: bool,
    ) -> TallyResult<Option<CacheProxy<S>>> {
        let key = RecordKey::new(type_tag.into(), id.into());
        let version = self
            .inner
            .cache
            .get_text(&key.version())
            .await?
            .unwrap_or_default();
        match self
            .inner
            .store
            .find_by_id(key.type_tag(), key.record_id())
            .await?
        {
            Some(record) => Ok(Some(CacheProxy::new(
                self.clone(),
                record,
                key,
                batched,
                version,
            ))),
            None => Ok(None),
        }
    }

    /// Reconcile one record now.
    pub async fn flush(
        &self,
        type_tag: impl Into<TypeTag>,
        id: impl Into<RecordId>,
    ) -> TallyResult<FlushOutcome> {
        self.inner
            .scheduler
            .run_sync(FlushJob::new(type_tag, id))
            .await
    }

    /// Save a record natively (outside the flush path).
    ///
    /// Runs under the record lock: the store save, then the refresh of live
    /// cache entries and a version bump.
    pub async fn save_native(&self, type_tag: &TypeTag, record: &mut S::Record) -> TallyResult<()> {
        let key = RecordKey::new(type_tag.clone(), record.id());
        let lock = DistributedLock::new(self.inner.cache.clone(), key.lock_name(), &self.inner.config);
        let cache = self.inner.cache.as_ref();
        let store = self.inner.store.as_ref();
        let registry = self.inner.registry.as_ref();
        lock.block(|| async move {
            let saved_fields = record.dirty_fields();
            store.save(type_tag, record).await?;
            hooks::refresh_on_save(cache, registry, type_tag, record, &saved_fields).await?;
            Ok(())
        })
        .await
    }

    /// Field-read hook bound to this context.
    pub async fn read_field(
        &self,
        type_tag: &TypeTag,
        record: &S::Record,
        field: &str,
    ) -> TallyResult<FieldValue> {
        hooks::read_field(
            self.inner.cache.as_ref(),
            &self.inner.registry,
            type_tag,
            record,
            field,
        )
        .await
    }

    /// Cached value lookup bound to this context.
    pub async fn read_cached_field(
        &self,
        type_tag: &TypeTag,
        id: &RecordId,
        field: &str,
    ) -> TallyResult<Option<f64>> {
        hooks::read_cached_field(self.inner.cache.as_ref(), type_tag, id, field).await
    }

    /// Version token for the record, created if missing.
    pub(crate) async fn current_version(&self, key: &RecordKey) -> TallyResult<String> {
        let token = self
            .inner
            .cache
            .remember_forever(&key.version(), || async {
                Ok(CacheValue::Text(new_version_token()))
            })
            .await?;
        Ok(match token {
            CacheValue::Text(token) => token,
            CacheValue::Counter(n) => n.to_string(),
        })
    }

    /// Arm the marker for `window`, scheduling a flush if it was not armed.
    pub(crate) async fn ensure_marker(
        &self,
        key: &RecordKey,
        window: ScheduleWindow,
    ) -> TallyResult<bool> {
        let delay = self.delay_for(window);
        let ttl = delay + self.inner.config.marker_grace;
        let armed = self
            .inner
            .cache
            .add(&key.marker(window), CacheValue::from(MARKER_VALUE), Some(ttl))
            .await?;
        if armed {
            self.inner
                .scheduler
                .schedule(FlushJob::from(key), delay)
                .await?;
        }
        Ok(armed)
    }

    /// Marker for a cold population: the long window, unless a short-window
    /// flush is already pending.
    pub(crate) async fn ensure_cold_marker(&self, key: &RecordKey) -> TallyResult<bool> {
        if self
            .inner
            .cache
            .has(&key.marker(ScheduleWindow::Short))
            .await?
        {
            return Ok(false);
        }
        self.ensure_marker(key, ScheduleWindow::Long).await
    }

    fn delay_for(&self, window: ScheduleWindow) -> Duration {
        let config = &self.inner.config;
        match window {
            ScheduleWindow::Short => config.short_delay,
            ScheduleWindow::Long => random_between(config.long_delay_min, config.long_delay_max),
        }
    }
}

fn random_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
}

/// Builder for [`CacheContext`].
pub struct CacheContextBuilder<S: BackingStore> {
    cache: Arc<dyn CacheStore>,
    store: Arc<S>,
    registry: FieldRegistry,
    config: TallyConfig,
}

impl<S: BackingStore> CacheContextBuilder<S> {
    /// Declare a cache-fronted type. Registering the same schema twice is a
    /// no-op.
    pub fn register_type(mut self, type_tag: impl Into<TypeTag>, schema: TypeSchema) -> Self {
        let type_tag = type_tag.into();
        if !self.registry.register(type_tag.clone(), schema) {
            tracing::trace!(type_tag = %type_tag, "Type already registered");
        }
        self
    }

    pub fn config(mut self, config: TallyConfig) -> Self {
        self.config = config;
        self
    }

    /// Build with flush runs on spawned tokio tasks.
    pub fn build_tokio(self) -> TallyResult<(CacheContext<S>, Arc<TokioJobScheduler<S>>)> {
        let parts = self.prepare()?;
        let scheduler = Arc::new(TokioJobScheduler::new(parts.worker.clone()));
        Ok((parts.finish(scheduler.clone()), scheduler))
    }

    /// Build with flush runs queued until the caller runs them.
    pub fn build_manual(self) -> TallyResult<(CacheContext<S>, Arc<ManualScheduler<S>>)> {
        let parts = self.prepare()?;
        let scheduler = Arc::new(ManualScheduler::new(parts.worker.clone()));
        Ok((parts.finish(scheduler.clone()), scheduler))
    }

    /// Build with a caller-supplied scheduler wrapped around the worker.
    pub fn build_with<F>(self, make_scheduler: F) -> TallyResult<CacheContext<S>>
    where
        F: FnOnce(Arc<FlushWorker<S>>) -> Arc<dyn JobScheduler>,
    {
        let parts = self.prepare()?;
        let scheduler = make_scheduler(parts.worker.clone());
        Ok(parts.finish(scheduler))
    }

    fn prepare(self) -> TallyResult<ContextParts<S>> {
        self.config.validate()?;
        let registry = Arc::new(self.registry);
        let worker = Arc::new(FlushWorker::new(
            self.cache.clone(),
            self.store.clone(),
            registry.clone(),
            self.config.clone(),
        ));
        Ok(ContextParts {
            cache: self.cache,
            store: self.store,
            registry,
            config: self.config,
            worker,
        })
    }
}

/// Validated pieces waiting for their scheduler.
struct ContextParts<S: BackingStore> {
    cache: Arc<dyn CacheStore>,
    store: Arc<S>,
    registry: Arc<FieldRegistry>,
    config: TallyConfig,
    worker: Arc<FlushWorker<S>>,
}

impl<S: BackingStore> ContextParts<S> {
    fn finish(self, scheduler: Arc<dyn JobScheduler>) -> CacheContext<S> {
        tracing::debug!(
            registered_types = self.registry.len(),
            short_delay_secs = self.config.short_delay.as_secs(),
            "Cache context built"
        );
        CacheContext {
            inner: Arc::new(ContextInner {
                cache: self.cache,
                store: self.store,
                scheduler,
                registry: self.registry,
                config: self.config,
                metrics: self.worker.metrics(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStore;
    use crate::store::{InMemoryBackingStore, MemoryRecord};
    use tally_core::TallyError;

    fn builder() -> CacheContextBuilder<InMemoryBackingStore> {
        let store = Arc::new(InMemoryBackingStore::new());
        store.insert("account", MemoryRecord::new(1i64).with_field("balance", 10i64));
        CacheContext::builder(Arc::new(InMemoryCacheStore::new()), store)
            .register_type("account", TypeSchema::new().cached("balance"))
    }

    #[test]
    fn test_random_between_stays_in_range() {
        let min = Duration::from_secs(10);
        let max = Duration::from_secs(20);
        for _ in 0..100 {
            let d = random_between(min, max);
            assert!(d >= min && d <= max);
        }
        assert_eq!(random_between(max, min), max);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = builder()
            .config(TallyConfig::default().with_lock_wait(Duration::ZERO))
            .build_manual();
        assert!(matches!(result, Err(TallyError::Config(_))));
    }

    #[test]
    fn test_register_type_is_idempotent() {
        let (ctx, _) = builder()
            .register_type("account", TypeSchema::new().cached("balance"))
            .build_manual()
            .unwrap();
        assert_eq!(ctx.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_marker_arms_once_and_schedules() {
        let (ctx, scheduler) = builder().build_manual().unwrap();
        let key = RecordKey::new(TypeTag::new("account"), RecordId::from(1i64));

        assert!(ctx.ensure_marker(&key, ScheduleWindow::Short).await.unwrap());
        assert!(!ctx.ensure_marker(&key, ScheduleWindow::Short).await.unwrap());
        assert!(!ctx.ensure_cold_marker(&key).await.unwrap());

        let pending = scheduler.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1, ctx.config().short_delay);
    }

    #[tokio::test]
    async fn test_version_token_is_stable_until_bumped() {
        let (ctx, _) = builder().build_manual().unwrap();
        let key = RecordKey::new(TypeTag::new("account"), RecordId::from(1i64));

        let first = ctx.current_version(&key).await.unwrap();
        let second = ctx.current_version(&key).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_load_missing_record() {
        let (ctx, _) = builder().build_manual().unwrap();
        assert!(ctx.load("account", 99i64, false).await.unwrap().is_none());
    }
}
