//! Deferred reconciliation jobs.
//!
//! - `flush`: the worker that drains cached deltas into the backing store
//! - `scheduler`: delayed execution on tokio tasks, or on demand
//!
//! # Usage
//!
//! ```ignore
//! use tally_storage::jobs::{FlushJob, JobScheduler};
//!
//! let job = FlushJob::new("account", 42i64);
//! scheduler.schedule(job.clone(), config.short_delay).await?;
//!
//! // Or reconcile right now
//! let outcome = scheduler.run_sync(job).await?;
//! ```

pub mod flush;
pub mod scheduler;

pub use flush::{FlushMetrics, FlushMetricsSnapshot, FlushWorker};
pub use scheduler::{ManualScheduler, TokioJobScheduler};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tally_core::{RecordId, RecordKey, TallyResult, TypeTag};

/// Descriptor of one reconciliation run for a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlushJob {
    pub type_tag: TypeTag,
    pub record_id: RecordId,
}

impl FlushJob {
    pub fn new(type_tag: impl Into<TypeTag>, record_id: impl Into<RecordId>) -> Self {
        Self {
            type_tag: type_tag.into(),
            record_id: record_id.into(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.type_tag.clone(), self.record_id.clone())
    }

    /// Key of the job-level overlap guard.
    pub fn overlap_key(&self) -> String {
        self.key().overlap_key()
    }
}

impl From<&RecordKey> for FlushJob {
    fn from(key: &RecordKey) -> Self {
        Self {
            type_tag: key.type_tag().clone(),
            record_id: key.record_id().clone(),
        }
    }
}

impl fmt::Display for FlushJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flush({}:{})", self.type_tag, self.record_id)
    }
}

/// Why a run did not complete and must run again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescheduleReason {
    /// The record lock stayed held past the wait bound.
    LockTimeout,
    /// Another run for the same record holds the overlap guard.
    Overlapping,
    /// Drain or persist failed; drained values were restored.
    Failure(String),
}

impl fmt::Display for RescheduleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RescheduleReason::LockTimeout => f.write_str("lock_timeout"),
            RescheduleReason::Overlapping => f.write_str("overlapping"),
            RescheduleReason::Failure(reason) => write!(f, "failure: {}", reason),
        }
    }
}

/// Terminal state of one flush run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Changed fields were written and the version token bumped.
    Persisted { fields: Vec<String> },
    /// Cached values matched the store; nothing written.
    Unchanged,
    /// The record no longer exists; its cache entries were removed.
    RecordGone { purged: u64 },
    /// The run must be retried after `after`.
    Rescheduled {
        reason: RescheduleReason,
        after: Duration,
    },
}

impl FlushOutcome {
    pub fn is_rescheduled(&self) -> bool {
        matches!(self, FlushOutcome::Rescheduled { .. })
    }

    /// Short label used in log fields.
    pub fn label(&self) -> &'static str {
        match self {
            FlushOutcome::Persisted { .. } => "persisted",
            FlushOutcome::Unchanged => "unchanged",
            FlushOutcome::RecordGone { .. } => "record_gone",
            FlushOutcome::Rescheduled { .. } => "rescheduled",
        }
    }
}

/// Transport for deferred flush runs.
///
/// Scheduling the same job twice is allowed; markers keep redundant runs
/// rare and the overlap guard keeps them from running concurrently.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Run `job` after `delay`. A rescheduled outcome is retried, never dropped.
    async fn schedule(&self, job: FlushJob, delay: Duration) -> TallyResult<()>;

    /// Run `job` now on the caller's task and return its outcome.
    async fn run_sync(&self, job: FlushJob) -> TallyResult<FlushOutcome>;
}
