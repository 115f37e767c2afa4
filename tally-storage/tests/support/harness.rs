//! Shared fixtures for tally-storage integration tests.
//!
//! Each test gets its own in-memory substrate and store, so tests never see
//! each other's keys.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tally_storage::{
    CacheContext, CacheProxy, FieldValue, InMemoryBackingStore, InMemoryCacheStore,
    ManualScheduler, MemoryRecord, RecordId, RecordKey, TallyConfig, TokioJobScheduler,
    TypeSchema, TypeTag,
};

pub const ACCOUNT: &str = "account";
pub const ACCOUNT_ID: i64 = 1;

pub struct Harness {
    pub ctx: CacheContext<InMemoryBackingStore>,
    pub cache: Arc<InMemoryCacheStore>,
    pub store: Arc<InMemoryBackingStore>,
    pub scheduler: Arc<ManualScheduler<InMemoryBackingStore>>,
}

impl Harness {
    /// Proxy over the seeded account.
    pub async fn account(&self, batched: bool) -> CacheProxy<InMemoryBackingStore> {
        self.ctx
            .load(ACCOUNT, ACCOUNT_ID, batched)
            .await
            .expect("load account")
            .expect("account exists")
    }

    /// Persisted balance, as the store holds it.
    pub fn stored_balance(&self) -> Option<f64> {
        self.store
            .value(&tag(), &id(), "balance")
            .and_then(|v| v.as_f64())
    }
}

pub fn tag() -> TypeTag {
    TypeTag::new(ACCOUNT)
}

pub fn id() -> RecordId {
    RecordId::from(ACCOUNT_ID)
}

pub fn key() -> RecordKey {
    RecordKey::new(tag(), id())
}

/// Short waits so contention tests fail fast instead of hanging.
pub fn test_config() -> TallyConfig {
    TallyConfig::default()
        .with_lock_wait(Duration::from_secs(5))
        .with_lock_poll_interval(Duration::from_millis(5))
}

fn seeded_store(balance: FieldValue) -> Arc<InMemoryBackingStore> {
    let store = Arc::new(InMemoryBackingStore::new());
    store.insert(
        ACCOUNT,
        MemoryRecord::new(ACCOUNT_ID)
            .with_field("id", ACCOUNT_ID)
            .with_field("balance", balance)
            .with_field("score", 0i64)
            .with_field("visits", 0i64)
            .with_field("owner", "alice"),
    );
    store
}

/// `visits` is numeric but deliberately left out of the schema.
pub fn schema() -> TypeSchema {
    TypeSchema::new().cached("balance").cached("score")
}

/// Account with the given balance behind a manual scheduler.
pub fn account_harness(balance: impl Into<FieldValue>) -> Harness {
    let cache = Arc::new(InMemoryCacheStore::new());
    let store = seeded_store(balance.into());
    let (ctx, scheduler) = CacheContext::builder(cache.clone(), store.clone())
        .register_type(ACCOUNT, schema())
        .config(test_config())
        .build_manual()
        .expect("valid config");
    Harness {
        ctx,
        cache,
        store,
        scheduler,
    }
}

/// Account behind a tokio scheduler; the caller drives time.
pub fn tokio_account_harness(
    balance: impl Into<FieldValue>,
    config: TallyConfig,
) -> (
    CacheContext<InMemoryBackingStore>,
    Arc<InMemoryCacheStore>,
    Arc<InMemoryBackingStore>,
    Arc<TokioJobScheduler<InMemoryBackingStore>>,
) {
    let cache = Arc::new(InMemoryCacheStore::new());
    let store = seeded_store(balance.into());
    let (ctx, scheduler) = CacheContext::builder(cache.clone(), store.clone())
        .register_type(ACCOUNT, schema())
        .config(config)
        .build_tokio()
        .expect("valid config");
    (ctx, cache, store, scheduler)
}
