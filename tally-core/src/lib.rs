//! TALLY Core - Types for the write-behind counter cache
//!
//! Pure data types and derivations with no I/O: record identity, fixed-point
//! scaling, the cache key namespace, the field registry, lock typestate,
//! errors and configuration. The substrate, store and worker live in
//! `tally-storage`.

pub mod config;
pub mod constants;
pub mod error;
pub mod fields;
pub mod identity;
pub mod keys;
pub mod lock;
pub mod scale;

pub use config::TallyConfig;
pub use error::{CacheError, ConfigError, StorageError, TallyError, TallyResult};
pub use fields::{FieldRegistry, FieldSpec, FieldValue, TypeSchema, DEFAULT_IDENTITY_FIELD};
pub use identity::{new_version_token, RecordId, Timestamp, TypeTag};
pub use keys::{cache_key, version_key, RecordKey, ScheduleWindow};
pub use lock::{check_held, Acquired, Lock, LockData, LockState, LockStateError};
pub use scale::{descale, descale_display, scale, SCALE_FACTOR};
