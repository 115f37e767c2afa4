//! End-to-end behaviour of proxies, flushes and hooks over in-memory
//! substrate and store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tally_storage::{
    BackingStore, CacheContext, CacheError, CacheStore, CacheStoreExt, CacheValue,
    DistributedLock, FieldValue, FlushOutcome, InMemoryBackingStore, InMemoryCacheStore,
    MemoryRecord, Record, RecordId, RecordKey, RescheduleReason, ScheduleWindow, TallyError,
    TallyResult, TypeTag,
};

#[path = "support/harness.rs"]
mod harness;
use harness::{account_harness, id, key, schema, tag, test_config, ACCOUNT, ACCOUNT_ID};

// ============================================================================
// READS AND WRITES
// ============================================================================

#[tokio::test]
async fn increment_then_get_reads_rounded_total() {
    let h = account_harness(FieldValue::Decimal(10.0));
    let mut account = h.account(false).await;

    account.increment("balance", 2.5, None).await.unwrap();

    assert_eq!(account.get("balance").await.unwrap(), 12.50);
    assert_eq!(account.get_scaled("balance").await.unwrap(), 12_500);
    // Nothing persisted yet.
    assert_eq!(h.stored_balance(), Some(10.0));
}

#[tokio::test]
async fn bounded_increment_past_max_leaves_cache_unchanged() {
    let h = account_harness(100i64);
    let mut account = h.account(false).await;

    let err = account
        .increment("balance", 60.0, Some(150.0))
        .await
        .unwrap_err();

    match err {
        TallyError::Cache(CacheError::LimitExceeded {
            field,
            attempted,
            bound,
        }) => {
            assert_eq!(field, "balance");
            assert_eq!(attempted, 160.0);
            assert_eq!(bound, 150.0);
        }
        other => panic!("expected LimitExceeded, got {other:?}"),
    }
    assert_eq!(account.get("balance").await.unwrap(), 100.00);
    assert!(!h.cache.has(&key().marker(ScheduleWindow::Short)).await.unwrap());
}

#[tokio::test]
async fn bounded_increment_up_to_max_succeeds() {
    let h = account_harness(100i64);
    let mut account = h.account(false).await;

    account.increment("balance", 50.0, Some(150.0)).await.unwrap();
    assert_eq!(account.get("balance").await.unwrap(), 150.0);
}

#[tokio::test]
async fn batched_deltas_stay_private_until_saved() {
    let h = account_harness(10i64);
    let mut a = h.account(true).await;
    let mut b = h.account(false).await;

    a.increment("balance", 5.0, None).await.unwrap();

    assert_eq!(b.get("balance").await.unwrap(), 10.0);
    assert_eq!(a.get("balance").await.unwrap(), 15.0);
    assert_eq!(a.pending_delta("balance"), 5.0);

    a.save_cache().await.unwrap();

    assert_eq!(a.pending_delta("balance"), 0.0);
    assert_eq!(b.get("balance").await.unwrap(), 15.0);
    assert_eq!(a.get("balance").await.unwrap(), 15.0);
    assert!(h.cache.has(&key().marker(ScheduleWindow::Short)).await.unwrap());
}

#[tokio::test]
async fn batched_mode_rejects_bounds_before_any_side_effect() {
    let h = account_harness(10i64);
    let mut a = h.account(true).await;

    a.increment("balance", 1.0, None).await.unwrap();
    let err = a.decrement("balance", 1.0, Some(0.0)).await.unwrap_err();

    assert!(err.is_transaction_misuse());
    assert_eq!(a.pending_delta("balance"), 1.0);
    assert_eq!(h.scheduler.pending_len().unwrap(), 0);
}

#[tokio::test]
async fn direct_save_is_forbidden() {
    let h = account_harness(10i64);
    let mut account = h.account(false).await;
    let err = account.save().await.unwrap_err();
    assert!(matches!(
        err,
        TallyError::Cache(CacheError::DirectSaveForbidden { .. })
    ));
}

#[tokio::test]
async fn unregistered_numeric_field_is_never_cached() {
    let h = account_harness(10i64);
    let mut account = h.account(false).await;

    let err = account.increment("visits", 5.0, None).await.unwrap_err();
    assert!(err.is_field_access());

    assert_eq!(account.flush_cache().await.unwrap(), FlushOutcome::Unchanged);
    assert!(!h.cache.has(&key().field("visits")).await.unwrap());
    assert_eq!(
        h.store.value(&tag(), &id(), "visits"),
        Some(FieldValue::Integer(0))
    );
}

#[tokio::test]
async fn non_numeric_field_read_is_field_access_error() {
    let h = account_harness(10i64);
    let mut account = h.account(false).await;

    assert!(account.get("owner").await.unwrap_err().is_field_access());
    assert!(account.get("missing").await.unwrap_err().is_field_access());
}

// ============================================================================
// FLUSH
// ============================================================================

#[tokio::test]
async fn flush_persists_and_second_flush_is_a_no_op() {
    let h = account_harness(10i64);
    let mut account = h.account(false).await;
    account.increment("balance", 2.5, None).await.unwrap();
    account.increment("score", 3.0, None).await.unwrap();

    let first = account.flush_cache().await.unwrap();
    match first {
        FlushOutcome::Persisted { mut fields } => {
            fields.sort();
            assert_eq!(fields, vec!["balance".to_string(), "score".to_string()]);
        }
        other => panic!("expected Persisted, got {other:?}"),
    }
    assert_eq!(h.stored_balance(), Some(12.5));
    assert_eq!(
        h.store.value(&tag(), &id(), "score"),
        Some(FieldValue::Integer(3))
    );
    assert_eq!(h.store.save_count(), 1);

    let second = account.flush_cache().await.unwrap();
    assert_eq!(second, FlushOutcome::Unchanged);
    assert_eq!(h.store.save_count(), 1);
    assert_eq!(h.stored_balance(), Some(12.5));

    for window in ScheduleWindow::ALL {
        assert!(!h.cache.has(&key().marker(window)).await.unwrap());
    }
}

#[tokio::test]
async fn flush_of_deleted_record_purges_every_key() {
    let h = account_harness(10i64);
    let mut account = h.account(false).await;
    account.increment("balance", 1.0, None).await.unwrap();
    assert!(!h.cache.keys_with_prefix(&key().record()).is_empty());

    h.store.remove(&tag(), &id());
    let outcome = account.flush_cache().await.unwrap();

    match outcome {
        FlushOutcome::RecordGone { purged } => assert!(purged >= 3),
        other => panic!("expected RecordGone, got {other:?}"),
    }
    assert!(h.cache.keys_with_prefix(&key().record()).is_empty());
    assert_eq!(h.scheduler.pending_len().unwrap(), 2);
}

#[tokio::test]
async fn failed_persist_restores_values_and_retries() {
    let h = account_harness(10i64);
    let mut account = h.account(false).await;
    account.increment("balance", 5.0, None).await.unwrap();
    h.store.fail_next_saves(1);

    let outcome = h.ctx.flush("account", 1i64).await.unwrap();
    assert!(matches!(
        outcome,
        FlushOutcome::Rescheduled {
            reason: RescheduleReason::Failure(_),
            ..
        }
    ));
    assert_eq!(account.get("balance").await.unwrap(), 15.0);
    assert_eq!(h.stored_balance(), Some(10.0));

    // The retry was queued; deltas made meanwhile are not lost.
    account.increment("balance", 1.0, None).await.unwrap();
    let outcomes = h.scheduler.run_pending().await.unwrap();
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, FlushOutcome::Persisted { .. })));
    assert_eq!(h.stored_balance(), Some(16.0));
    assert_eq!(h.ctx.metrics().snapshot().failures, 1);
}

#[tokio::test]
async fn stale_proxy_reloads_after_flush_bumps_version() {
    let h = account_harness(10i64);
    let mut stale = h.account(false).await;
    let mut writer = h.account(false).await;

    writer.increment("balance", 5.0, None).await.unwrap();
    writer.flush_cache().await.unwrap();
    assert_eq!(h.stored_balance(), Some(15.0));

    // `stale` still holds the record as loaded with balance 10; the cache is
    // cold again, so its next read must re-fetch instead of reviving 10.
    assert_eq!(stale.get("balance").await.unwrap(), 15.0);
    stale.increment("balance", 1.0, None).await.unwrap();
    stale.flush_cache().await.unwrap();
    assert_eq!(h.stored_balance(), Some(16.0));
}

/// Store whose first lookup is overtaken by a flush: the record is read,
/// then 15 is persisted and the version token moves on.
struct FlushRacingStore {
    inner: Arc<InMemoryBackingStore>,
    cache: Arc<InMemoryCacheStore>,
    race_pending: AtomicBool,
}

#[async_trait]
impl BackingStore for FlushRacingStore {
    type Record = MemoryRecord;

    async fn find_by_id(
        &self,
        type_tag: &TypeTag,
        id: &RecordId,
    ) -> TallyResult<Option<MemoryRecord>> {
        let found = self.inner.find_by_id(type_tag, id).await?;
        if self.race_pending.swap(false, Ordering::SeqCst) {
            if let Some(mut newer) = found.clone() {
                newer.set("balance", FieldValue::Integer(15));
                self.inner.save(type_tag, &mut newer).await?;
                let version = RecordKey::new(type_tag.clone(), id.clone()).version();
                self.cache
                    .put(&version, CacheValue::from("v2"), None)
                    .await?;
            }
        }
        Ok(found)
    }

    async fn save(&self, type_tag: &TypeTag, record: &mut MemoryRecord) -> TallyResult<()> {
        self.inner.save(type_tag, record).await
    }
}

#[tokio::test]
async fn load_overtaken_by_flush_reads_the_persisted_value() {
    let cache = Arc::new(InMemoryCacheStore::new());
    let inner = Arc::new(InMemoryBackingStore::new());
    inner.insert(
        ACCOUNT,
        MemoryRecord::new(ACCOUNT_ID)
            .with_field("id", ACCOUNT_ID)
            .with_field("balance", 10i64),
    );
    cache
        .put(&key().version(), CacheValue::from("v1"), None)
        .await
        .unwrap();
    let store = Arc::new(FlushRacingStore {
        inner: inner.clone(),
        cache: cache.clone(),
        race_pending: AtomicBool::new(true),
    });
    let (ctx, _scheduler) = CacheContext::builder(cache.clone(), store)
        .register_type(ACCOUNT, schema())
        .config(test_config())
        .build_manual()
        .unwrap();

    let mut account = ctx.load(ACCOUNT, ACCOUNT_ID, false).await.unwrap().unwrap();
    assert_eq!(account.version(), "v1");
    assert_eq!(account.record().get("balance").unwrap(), FieldValue::Integer(10));

    assert_eq!(account.get("balance").await.unwrap(), 15.0);
    assert_eq!(account.version(), "v2");

    account.increment("balance", 1.0, None).await.unwrap();
    account.flush_cache().await.unwrap();
    assert_eq!(
        inner.value(&tag(), &id(), "balance"),
        Some(FieldValue::Integer(16))
    );
}

// ============================================================================
// LOCK CONTENTION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn cold_read_times_out_while_record_lock_is_held() {
    let h = account_harness(10i64);
    let mut account = h.account(false).await;
    let holder = DistributedLock::new(h.cache.clone(), key().lock_name(), &test_config());
    let held = holder.acquire().await.unwrap();

    let err = account.get("balance").await.unwrap_err();
    assert!(err.is_lock_timeout());
    assert!(!h.cache.has(&key().field("balance")).await.unwrap());
    assert_eq!(h.scheduler.pending_len().unwrap(), 0);

    holder.release(held).await.unwrap();
    assert_eq!(account.get("balance").await.unwrap(), 10.0);
}

#[tokio::test(start_paused = true)]
async fn bounded_increment_times_out_while_bound_lock_is_held() {
    let h = account_harness(100i64);
    let mut account = h.account(false).await;
    assert_eq!(account.get("balance").await.unwrap(), 100.0);

    let holder = DistributedLock::new(
        h.cache.clone(),
        key().bound_lock_name("balance"),
        &test_config(),
    );
    let _held = holder.acquire().await.unwrap();

    let err = account
        .increment("balance", 10.0, Some(150.0))
        .await
        .unwrap_err();
    assert!(err.is_lock_timeout());
    assert_eq!(account.get("balance").await.unwrap(), 100.0);
    assert!(!h.cache.has(&key().marker(ScheduleWindow::Short)).await.unwrap());

    // Unbounded writes take no lock and still go through.
    account.increment("balance", 10.0, None).await.unwrap();
    assert_eq!(account.get("balance").await.unwrap(), 110.0);
}

// ============================================================================
// HOOKS
// ============================================================================

#[tokio::test]
async fn field_read_hook_sees_cached_value_while_flush_pending() {
    let h = account_harness(10i64);
    let mut account = h.account(false).await;
    account.increment("balance", 2.0, None).await.unwrap();

    let record = h.store.snapshot(&tag(), &id()).unwrap();
    assert_eq!(
        h.ctx.read_field(&tag(), &record, "balance").await.unwrap(),
        FieldValue::Integer(12)
    );
    assert_eq!(
        h.ctx.read_field(&tag(), &record, "owner").await.unwrap(),
        FieldValue::from("alice")
    );
    assert_eq!(
        h.ctx
            .read_cached_field(&tag(), &id(), "balance")
            .await
            .unwrap(),
        Some(12.0)
    );

    account.flush_cache().await.unwrap();
    let record = h.store.snapshot(&tag(), &id()).unwrap();
    assert_eq!(
        h.ctx.read_field(&tag(), &record, "balance").await.unwrap(),
        FieldValue::Integer(12)
    );
    assert_eq!(
        h.ctx
            .read_cached_field(&tag(), &id(), "balance")
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn native_save_refreshes_cache_and_version() {
    let h = account_harness(10i64);
    let mut account = h.account(false).await;
    account.increment("balance", 5.0, None).await.unwrap();
    let old_version = h.cache.get_text(&key().version()).await.unwrap();

    let mut record = h.store.snapshot(&tag(), &id()).unwrap();
    record.set("balance", FieldValue::Integer(500));
    h.ctx.save_native(&tag(), &mut record).await.unwrap();

    assert!(!record.is_dirty());
    assert_eq!(h.stored_balance(), Some(500.0));
    assert_eq!(account.get("balance").await.unwrap(), 500.0);
    assert_ne!(
        h.cache.get_text(&key().version()).await.unwrap(),
        old_version
    );

    let mut fresh = h.account(false).await;
    assert_eq!(fresh.get("balance").await.unwrap(), 500.0);
}
