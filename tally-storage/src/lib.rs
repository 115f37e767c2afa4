//! TALLY Storage - Write-behind cache runtime
//!
//! Everything with I/O lives here:
//!
//! - `cache`: the substrate trait and an in-memory implementation
//! - `store`: the backing store and record traits, with an in-memory store
//! - `lock`: blocking named locks over the substrate
//! - `proxy`: the per-record handle callers increment and read through
//! - `jobs`: the flush worker and its schedulers
//! - `hooks`: field-read and native-save hooks for the store's own paths
//! - `context`: wiring of all of the above
//!
//! Pure types (keys, scaling, registry, errors, config) come from
//! `tally-core` and are re-exported for convenience.

pub mod cache;
pub mod context;
pub mod hooks;
pub mod jobs;
pub mod lock;
pub mod proxy;
pub mod store;
pub mod telemetry;

pub use cache::{CacheStore, CacheStoreExt, CacheValue, InMemoryCacheStore};
pub use context::{CacheContext, CacheContextBuilder};
pub use hooks::{read_cached_field, read_field, refresh_on_save};
pub use jobs::{
    FlushJob, FlushMetrics, FlushMetricsSnapshot, FlushOutcome, FlushWorker, JobScheduler,
    ManualScheduler, RescheduleReason, TokioJobScheduler,
};
pub use lock::DistributedLock;
pub use proxy::CacheProxy;
pub use store::{BackingStore, InMemoryBackingStore, MemoryRecord, Record};
pub use telemetry::{init_tracing, TelemetryConfig};

pub use tally_core::{
    CacheError, ConfigError, FieldRegistry, FieldSpec, FieldValue, RecordId, RecordKey,
    ScheduleWindow, StorageError, TallyConfig, TallyError, TallyResult, TypeSchema, TypeTag,
};
