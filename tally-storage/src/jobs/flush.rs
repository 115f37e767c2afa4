//! Flush worker: merges cached deltas back into the backing store.
//!
//! One run for a record goes through these states:
//!
//! ```text
//! Scheduled → Acquiring-Lock → Reconciling → {Persisted | Unchanged | RecordGone} → Released
//!                  │                 │
//!                  │ timeout         │ drain/persist failure
//!                  ▼                 ▼
//!             Rescheduled    Released-With-Error → Rescheduled
//! ```
//!
//! Reconciliation happens under the per-record lock, which also serialises
//! cold population, so a value drained here can never be re-populated from a
//! stale store read in the middle of the run. Concurrent runs are excluded
//! one level up by the overlap guard taken in [`FlushWorker::handle`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tally_core::{
    new_version_token, scale, Acquired, FieldRegistry, FieldValue, Lock, RecordKey,
    ScheduleWindow, StorageError, TallyConfig, TallyResult,
};
use uuid::Uuid;

use super::{FlushJob, FlushOutcome, RescheduleReason};
use crate::cache::{CacheStore, CacheValue};
use crate::lock::DistributedLock;
use crate::store::{BackingStore, Record};

// ============================================================================
// METRICS
// ============================================================================

/// Counters for flush activity since startup.
#[derive(Debug, Default)]
pub struct FlushMetrics {
    /// Runs that reached a terminal outcome or were rescheduled
    pub runs: AtomicU64,

    /// Runs that wrote at least one field
    pub persisted: AtomicU64,

    /// Runs where the cache matched the store
    pub unchanged: AtomicU64,

    /// Runs that found the record deleted
    pub records_gone: AtomicU64,

    /// Runs sent back for retry (contention or failure)
    pub rescheduled: AtomicU64,

    /// Reconciliation failures (subset of `rescheduled`)
    pub failures: AtomicU64,

    /// Total fields written across all runs
    pub fields_written: AtomicU64,
}

impl FlushMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> FlushMetricsSnapshot {
        FlushMetricsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            records_gone: self.records_gone.load(Ordering::Relaxed),
            rescheduled: self.rescheduled.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            fields_written: self.fields_written.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &FlushOutcome) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        match outcome {
            FlushOutcome::Persisted { fields } => {
                self.persisted.fetch_add(1, Ordering::Relaxed);
                self.fields_written
                    .fetch_add(fields.len() as u64, Ordering::Relaxed);
            }
            FlushOutcome::Unchanged => {
                self.unchanged.fetch_add(1, Ordering::Relaxed);
            }
            FlushOutcome::RecordGone { .. } => {
                self.records_gone.fetch_add(1, Ordering::Relaxed);
            }
            FlushOutcome::Rescheduled { reason, .. } => {
                self.rescheduled.fetch_add(1, Ordering::Relaxed);
                if matches!(reason, RescheduleReason::Failure(_)) {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Snapshot of flush metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushMetricsSnapshot {
    pub runs: u64,
    pub persisted: u64,
    pub unchanged: u64,
    pub records_gone: u64,
    pub rescheduled: u64,
    pub failures: u64,
    pub fields_written: u64,
}

// ============================================================================
// WORKER
// ============================================================================

/// Reconciles cached values of one record into the backing store.
pub struct FlushWorker<S: BackingStore> {
    cache: Arc<dyn CacheStore>,
    store: Arc<S>,
    registry: Arc<FieldRegistry>,
    config: TallyConfig,
    metrics: Arc<FlushMetrics>,
}

impl<S: BackingStore> FlushWorker<S> {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        store: Arc<S>,
        registry: Arc<FieldRegistry>,
        config: TallyConfig,
    ) -> Self {
        Self {
            cache,
            store,
            registry,
            config,
            metrics: Arc::new(FlushMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<FlushMetrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &TallyConfig {
        &self.config
    }

    /// Entry point for schedulers: takes the overlap guard, then runs.
    ///
    /// A second run for a record whose guard is held is rescheduled instead
    /// of waiting on the record lock.
    pub async fn handle(&self, job: &FlushJob) -> TallyResult<FlushOutcome> {
        let guard_name = job.overlap_key();
        let guard = self
            .cache
            .try_acquire_lock(&guard_name, Uuid::now_v7(), self.config.overlap_release_after)
            .await?;

        let outcome = match guard {
            None => FlushOutcome::Rescheduled {
                reason: RescheduleReason::Overlapping,
                after: self.config.retry_backoff,
            },
            Some(guard) => {
                let outcome = self.run(job).await;
                if let Err(e) = self.cache.release_lock(guard.release()).await {
                    tracing::warn!(job = %job, error = %e, "Failed to release overlap guard");
                }
                outcome?
            }
        };

        self.metrics.record(&outcome);
        if let FlushOutcome::Rescheduled { reason, after } = &outcome {
            tracing::warn!(
                type_tag = %job.type_tag,
                record_id = %job.record_id,
                outcome = outcome.label(),
                reason = %reason,
                retry_in_secs = after.as_secs(),
                "Flush rescheduled"
            );
        }
        Ok(outcome)
    }

    /// One reconciliation run under the record lock.
    ///
    /// Contention and reconciliation failures come back as
    /// [`FlushOutcome::Rescheduled`]; only substrate failures on the lock
    /// itself are errors.
    pub async fn run(&self, job: &FlushJob) -> TallyResult<FlushOutcome> {
        let key = job.key();
        let lock = DistributedLock::new(self.cache.clone(), key.lock_name(), &self.config);
        let mut held = match lock.acquire().await {
            Ok(held) => held,
            Err(e) if e.is_lock_timeout() => {
                return Ok(FlushOutcome::Rescheduled {
                    reason: RescheduleReason::LockTimeout,
                    after: self.config.retry_backoff,
                })
            }
            Err(e) => return Err(e),
        };

        let result = self.reconcile(&key, &lock, &mut held).await;

        if let Err(e) = lock.release(held).await {
            tracing::warn!(lock = %lock.name(), error = %e, "Failed to release record lock");
        }

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::warn!(
                    type_tag = %key.type_tag(),
                    record_id = %key.record_id(),
                    error = %e,
                    "Reconciliation failed, drained values restored"
                );
                Ok(FlushOutcome::Rescheduled {
                    reason: RescheduleReason::Failure(e.to_string()),
                    after: self.config.retry_backoff,
                })
            }
        }
    }

    /// Drain, compare and persist. Caller holds the record lock.
    async fn reconcile(
        &self,
        key: &RecordKey,
        lock: &DistributedLock,
        held: &mut Lock<Acquired>,
    ) -> TallyResult<FlushOutcome> {
        let type_tag = key.type_tag();
        let Some(mut record) = self.store.find_by_id(type_tag, key.record_id()).await? else {
            let purged = self.cache.forget_prefix(&key.record()).await?;
            tracing::debug!(
                type_tag = %type_tag,
                record_id = %key.record_id(),
                purged,
                outcome = "record_gone",
                "Record deleted, cache entries purged"
            );
            return Ok(FlushOutcome::RecordGone { purged });
        };

        let mut drained: Vec<(String, i64)> = Vec::new();
        let mut changed: Vec<String> = Vec::new();

        for field in record.field_names() {
            if !self.registry.is_cached(type_tag, &field) {
                continue;
            }
            let current = match record.get(&field) {
                Ok(value) if value.is_numeric() => value,
                _ => continue,
            };

            let field_key = key.field(&field);
            let scaled = match self.cache.pull(&field_key).await {
                Ok(Some(CacheValue::Counter(scaled))) => scaled,
                Ok(Some(other)) => {
                    // Not ours to drain; put it back untouched.
                    self.cache.put(&field_key, other, None).await?;
                    continue;
                }
                Ok(None) => continue,
                Err(e) => {
                    self.restore(key, &drained).await;
                    return Err(e);
                }
            };
            drained.push((field.clone(), scaled));

            let stored = current.as_f64().map(scale);
            if stored != Some(scaled) {
                record.set(&field, FieldValue::from_scaled_like(scaled, &current));
                changed.push(field);
            }
        }

        if !changed.is_empty() {
            if let Err(e) = self.renew_lease(lock, held).await {
                self.restore(key, &drained).await;
                return Err(e);
            }
            if let Err(e) = self.store.save(type_tag, &mut record).await {
                self.restore(key, &drained).await;
                return Err(StorageError::Reconciliation {
                    record: key.to_string(),
                    reason: e.to_string(),
                }
                .into());
            }
            self.cache
                .put(&key.version(), CacheValue::Text(new_version_token()), None)
                .await?;
        }

        for window in ScheduleWindow::ALL {
            self.cache.forget(&key.marker(window)).await?;
        }

        if changed.is_empty() {
            tracing::trace!(
                type_tag = %type_tag,
                record_id = %key.record_id(),
                drained = drained.len(),
                outcome = "unchanged",
                "Flush found no changes"
            );
            Ok(FlushOutcome::Unchanged)
        } else {
            tracing::info!(
                type_tag = %type_tag,
                record_id = %key.record_id(),
                fields = ?changed,
                outcome = "persisted",
                "Flushed cached fields"
            );
            Ok(FlushOutcome::Persisted { fields: changed })
        }
    }

    /// Make sure the record lock outlives the save. A lease that already ran
    /// out means another run may own the record, so the save is abandoned.
    async fn renew_lease(
        &self,
        lock: &DistributedLock,
        held: &mut Lock<Acquired>,
    ) -> TallyResult<()> {
        let lease = self.config.lock_lease;
        if held
            .remaining_duration(Utc::now())
            .is_some_and(|left| left >= lease / 2)
        {
            return Ok(());
        }
        *held = lock.extend(held.clone(), lease).await?;
        tracing::debug!(lock = %lock.name(), "Record lock lease extended");
        Ok(())
    }

    /// Put drained values back so no delta is lost when a run fails.
    async fn restore(&self, key: &RecordKey, drained: &[(String, i64)]) {
        for (field, scaled) in drained {
            if let Err(e) = self
                .cache
                .put(&key.field(field), CacheValue::Counter(*scaled), None)
                .await
            {
                tracing::error!(
                    type_tag = %key.type_tag(),
                    record_id = %key.record_id(),
                    field = %field,
                    scaled = *scaled,
                    error = %e,
                    "Failed to restore drained value"
                );
            }
        }
    }
}
