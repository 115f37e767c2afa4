//! Per-record cache-aware handle.
//!
//! A `CacheProxy` wraps one loaded record. Reads go through the shared cache
//! (populating it on first access), writes are atomic counter updates on the
//! substrate, and persistence is left to the flush worker.
//!
//! # Modes
//!
//! - **Direct**: every increment lands in the shared cache immediately.
//! - **Batched**: increments accumulate in a private pending map, visible
//!   only through this proxy until [`CacheProxy::save_cache`] merges them.
//!   Bounded mutations are rejected in this mode because the bound cannot
//!   be checked atomically against deltas that are not shared yet.
//!
//! # Locking
//!
//! | Operation              | Lock                       |
//! |------------------------|----------------------------|
//! | cold population        | record lock                |
//! | unbounded increment    | none (atomic add)          |
//! | bounded increment      | bound lock, then record lock on a cold field |
//! | flush                  | overlap guard, record lock |

use std::collections::BTreeMap;

use tally_core::{
    descale, descale_display, scale, CacheError, RecordKey, ScheduleWindow, StorageError,
    TallyError, TallyResult,
};

use crate::cache::{CacheStoreExt, CacheValue};
use crate::context::CacheContext;
use crate::jobs::{FlushJob, FlushOutcome};
use crate::lock::DistributedLock;
use crate::store::{BackingStore, Record};

/// Attempts at applying a delta before giving up on a counter that keeps
/// being drained between population and increment.
const MAX_APPLY_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy)]
enum Bound {
    Max(f64),
    Min(f64),
}

impl Bound {
    fn value(self) -> f64 {
        match self {
            Bound::Max(v) | Bound::Min(v) => v,
        }
    }

    fn is_violated_by(self, prospective: i64) -> bool {
        match self {
            Bound::Max(max) => prospective > scale(max),
            Bound::Min(min) => prospective < scale(min),
        }
    }
}

/// Cache-aware handle for one record.
pub struct CacheProxy<S: BackingStore> {
    ctx: CacheContext<S>,
    record: S::Record,
    key: RecordKey,
    batched: bool,
    pending: BTreeMap<String, i64>,
    version: String,
}

impl<S: BackingStore> CacheProxy<S> {
    pub(crate) fn new(
        ctx: CacheContext<S>,
        record: S::Record,
        key: RecordKey,
        batched: bool,
        version: String,
    ) -> Self {
        Self {
            ctx,
            record,
            key,
            batched,
            pending: BTreeMap::new(),
            version,
        }
    }

    /// The wrapped record, as last loaded.
    pub fn record(&self) -> &S::Record {
        &self.record
    }

    pub fn into_record(self) -> S::Record {
        self.record
    }

    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    pub fn is_batched(&self) -> bool {
        self.batched
    }

    /// Version token the proxy's record was loaded under. Empty while no
    /// token is known; the first cold population then re-reads the record.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Unsaved batched delta for `field`, descaled.
    pub fn pending_delta(&self, field: &str) -> f64 {
        descale(self.pending.get(field).copied().unwrap_or(0))
    }

    /// Current value of `field`, rounded to two decimals.
    ///
    /// The identity field is read from the record and must be numeric;
    /// string and UUID ids are available through `record().id()`.
    ///
    /// # Errors
    ///
    /// - `LockTimeout` if a cold population could not take the record lock
    /// - `FieldAccess` if the field is not registered as cached, or the
    ///   record has no such field, or its value is not numeric
    pub async fn get(&mut self, field: &str) -> TallyResult<f64> {
        if self.is_identity(field) {
            return self.record_number(field);
        }
        Ok(descale_display(self.get_scaled(field).await?))
    }

    /// Current value of `field` in scaled form, without display rounding.
    pub async fn get_scaled(&mut self, field: &str) -> TallyResult<i64> {
        if self.is_identity(field) {
            return Ok(scale(self.record_number(field)?));
        }
        self.ensure_cached(field)?;
        let shared = self.shared_value(field).await?;
        let pending = if self.batched {
            self.pending.get(field).copied().unwrap_or(0)
        } else {
            0
        };
        Ok(shared.saturating_add(pending))
    }

    /// Add `amount` to `field`, optionally refusing to go above `max`.
    ///
    /// # Errors
    ///
    /// - `LimitExceeded` if the result would exceed `max`; nothing changes
    /// - `TransactionMisuse` if `max` is given in batched mode
    /// - `LockTimeout` if the bound lock or record lock was not acquired
    /// - `InvalidAmount` if `amount` or `max` is NaN or infinite
    /// - `FieldAccess` if the field is not registered as cached
    pub async fn increment(&mut self, field: &str, amount: f64, max: Option<f64>) -> TallyResult<()> {
        let delta = self.scaled_amount(field, amount)?;
        let bound = self.checked_bound(field, max.map(Bound::Max))?;
        self.mutate(field, delta, bound).await
    }

    /// Subtract `amount` from `field`, optionally refusing to go below `min`.
    pub async fn decrement(&mut self, field: &str, amount: f64, min: Option<f64>) -> TallyResult<()> {
        let delta = self
            .scaled_amount(field, amount)?
            .checked_neg()
            .ok_or_else(|| invalid_amount(field, amount))?;
        let bound = self.checked_bound(field, min.map(Bound::Min))?;
        self.mutate(field, delta, bound).await
    }

    /// Merge pending batched deltas into the shared cache.
    ///
    /// On failure the deltas that were not applied stay pending, so the call
    /// can be retried without double counting.
    pub async fn save_cache(&mut self) -> TallyResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut remaining = std::mem::take(&mut self.pending).into_iter();
        while let Some((field, delta)) = remaining.next() {
            if let Err(e) = self.apply_delta(&field, delta).await {
                self.pending.insert(field, delta);
                self.pending.extend(remaining);
                return Err(e);
            }
        }

        self.ctx.ensure_marker(&self.key, ScheduleWindow::Short).await?;
        Ok(())
    }

    /// Direct persistence is not allowed; the flush worker owns it.
    pub async fn save(&mut self) -> TallyResult<()> {
        Err(CacheError::DirectSaveForbidden {
            record: self.key.to_string(),
        }
        .into())
    }

    /// Reconcile this record into the store now.
    pub async fn flush_cache(&self) -> TallyResult<FlushOutcome> {
        self.ctx
            .scheduler()
            .run_sync(FlushJob::from(&self.key))
            .await
    }

    async fn mutate(&mut self, field: &str, delta: i64, bound: Option<Bound>) -> TallyResult<()> {
        if self.batched {
            if bound.is_some() {
                return Err(CacheError::TransactionMisuse {
                    field: field.to_string(),
                }
                .into());
            }
            let pending = self.pending.entry(field.to_string()).or_insert(0);
            *pending = pending.saturating_add(delta);
            return Ok(());
        }

        match bound {
            None => {
                self.apply_delta(field, delta).await?;
            }
            Some(bound) => {
                let lock = DistributedLock::new(
                    self.ctx.cache().clone(),
                    self.key.bound_lock_name(field),
                    self.ctx.config(),
                );
                let this = &mut *self;
                lock.block(|| async move { this.apply_bounded(field, delta, bound).await })
                    .await?;
            }
        }

        self.ctx.ensure_marker(&self.key, ScheduleWindow::Short).await?;
        Ok(())
    }

    /// Check-then-act under the bound lock.
    async fn apply_bounded(&mut self, field: &str, delta: i64, bound: Bound) -> TallyResult<()> {
        let current = self.shared_value(field).await?;
        let prospective = current.saturating_add(delta);
        if bound.is_violated_by(prospective) {
            tracing::debug!(
                type_tag = %self.key.type_tag(),
                record_id = %self.key.record_id(),
                field = %field,
                attempted = descale(prospective),
                bound = bound.value(),
                "Bounded update rejected"
            );
            return Err(CacheError::LimitExceeded {
                field: field.to_string(),
                attempted: descale(prospective),
                bound: bound.value(),
            }
            .into());
        }
        self.apply_delta(field, delta).await?;
        Ok(())
    }

    /// Atomically add `delta`, populating the field first if it is cold.
    async fn apply_delta(&mut self, field: &str, delta: i64) -> TallyResult<i64> {
        let field_key = self.key.field(field);
        for _ in 0..MAX_APPLY_ATTEMPTS {
            if let Some(value) = self.ctx.cache().increment(&field_key, delta).await? {
                return Ok(value);
            }
            self.populate(field).await?;
        }
        Err(CacheError::Substrate {
            reason: format!("{} was drained {} times in a row", field_key, MAX_APPLY_ATTEMPTS),
        }
        .into())
    }

    /// Shared cached value, populating on a miss.
    async fn shared_value(&mut self, field: &str) -> TallyResult<i64> {
        if let Some(value) = self.ctx.cache().get_counter(&self.key.field(field)).await? {
            return Ok(value);
        }
        self.populate(field).await
    }

    async fn populate(&mut self, field: &str) -> TallyResult<i64> {
        let lock = DistributedLock::new(
            self.ctx.cache().clone(),
            self.key.lock_name(),
            self.ctx.config(),
        );
        let this = &mut *self;
        lock.block(|| async move { this.populate_locked(field).await })
            .await
    }

    /// Cold population. Caller holds the record lock.
    async fn populate_locked(&mut self, field: &str) -> TallyResult<i64> {
        let field_key = self.key.field(field);
        if let Some(value) = self.ctx.cache().get_counter(&field_key).await? {
            return Ok(value);
        }

        self.reload_if_stale().await?;
        let base = scale(self.record_number(field)?);

        if !self
            .ctx
            .cache()
            .add(&field_key, CacheValue::Counter(base), None)
            .await?
        {
            return self
                .ctx
                .cache()
                .get_counter(&field_key)
                .await?
                .ok_or_else(|| {
                    CacheError::Substrate {
                        reason: format!("{} vanished during population", field_key),
                    }
                    .into()
                });
        }

        tracing::debug!(
            type_tag = %self.key.type_tag(),
            record_id = %self.key.record_id(),
            field = %field,
            base,
            "Cold field populated"
        );
        self.ctx.ensure_cold_marker(&self.key).await?;
        Ok(base)
    }

    /// Reload the record when its version token moved since it was loaded.
    ///
    /// A missing token counts as moved: it is only removed together with
    /// the record's other cache entries.
    async fn reload_if_stale(&mut self) -> TallyResult<()> {
        let current = self.ctx.cache().get_text(&self.key.version()).await?;
        if current.as_deref() == Some(self.version.as_str()) {
            return Ok(());
        }

        let fresh = self
            .ctx
            .store()
            .find_by_id(self.key.type_tag(), self.key.record_id())
            .await?
            .ok_or_else(|| StorageError::NotFound {
                record: self.key.to_string(),
            })?;
        self.record = fresh;
        self.version = match current {
            Some(token) => token,
            None => self.ctx.current_version(&self.key).await?,
        };

        tracing::debug!(
            type_tag = %self.key.type_tag(),
            record_id = %self.key.record_id(),
            version = %self.version,
            "Version changed, record reloaded"
        );
        Ok(())
    }

    /// Reject fields the flush worker would never drain.
    fn ensure_cached(&self, field: &str) -> TallyResult<()> {
        if self.ctx.registry().is_cached(self.key.type_tag(), field) {
            return Ok(());
        }
        Err(StorageError::FieldAccess {
            record: self.key.to_string(),
            field: field.to_string(),
            reason: "field is not registered as cached".to_string(),
        }
        .into())
    }

    fn scaled_amount(&self, field: &str, amount: f64) -> TallyResult<i64> {
        self.ensure_cached(field)?;
        if !amount.is_finite() {
            return Err(invalid_amount(field, amount));
        }
        Ok(scale(amount))
    }

    fn checked_bound(&self, field: &str, bound: Option<Bound>) -> TallyResult<Option<Bound>> {
        match bound {
            Some(bound) if !bound.value().is_finite() => Err(invalid_amount(field, bound.value())),
            other => Ok(other),
        }
    }

    fn is_identity(&self, field: &str) -> bool {
        self.ctx.registry().identity_field(self.key.type_tag()) == field
    }

    fn record_number(&self, field: &str) -> TallyResult<f64> {
        let value = self.record.get(field)?;
        value.as_f64().ok_or_else(|| {
            StorageError::FieldAccess {
                record: self.key.to_string(),
                field: field.to_string(),
                reason: if value.is_null() {
                    "value is null".to_string()
                } else {
                    "value is not numeric".to_string()
                },
            }
            .into()
        })
    }
}

fn invalid_amount(field: &str, value: f64) -> TallyError {
    CacheError::InvalidAmount {
        field: field.to_string(),
        value,
    }
    .into()
}
