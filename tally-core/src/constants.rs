//! Default values for the cache-coherence protocol.
//!
//! Centralised here so configuration defaults and tests agree.

// ============================================================================
// LOCKING
// ============================================================================

/// Default bounded wait for the per-record and bound-check locks (seconds)
pub const DEFAULT_LOCK_WAIT_SECS: u64 = 10;

/// Default lease on a held lock; an abandoned lock frees itself after this (seconds)
pub const DEFAULT_LOCK_LEASE_SECS: u64 = 60;

/// Default delay between lock acquisition attempts (milliseconds)
pub const DEFAULT_LOCK_POLL_INTERVAL_MS: u64 = 25;

// ============================================================================
// SCHEDULING WINDOWS
// ============================================================================

/// Delay before a flush scheduled in the short window runs (seconds)
pub const DEFAULT_SHORT_DELAY_SECS: u64 = 15;

/// Lower bound of the randomized long-window delay (seconds, 2 hours)
pub const DEFAULT_LONG_DELAY_MIN_SECS: u64 = 2 * 3600;

/// Upper bound of the randomized long-window delay (seconds, 6 hours)
pub const DEFAULT_LONG_DELAY_MAX_SECS: u64 = 6 * 3600;

/// Extra lifetime granted to a scheduling marker beyond its window (seconds)
pub const DEFAULT_MARKER_GRACE_SECS: u64 = 600;

// ============================================================================
// RETRIES
// ============================================================================

/// Backoff before a rescheduled flush runs again (seconds)
pub const DEFAULT_RETRY_BACKOFF_SECS: u64 = 30;

/// How long the overlap guard blocks a second run for the same record (seconds)
pub const DEFAULT_OVERLAP_RELEASE_AFTER_SECS: u64 = 60;

// ============================================================================
// KEY LAYOUT
// ============================================================================

/// Suffix appended to the record key to form the version token key
pub const VERSION_SUFFIX: &str = "cache_version";

/// Prefix for per-record reconciliation lock names
pub const RECORD_LOCK_PREFIX: &str = "save_model_lock";

/// Prefix for per-field bound-check lock names
pub const BOUND_LOCK_PREFIX: &str = "bound_check_lock";

/// Prefix for the job-level overlap guard
pub const OVERLAP_PREFIX: &str = "model_cache";

/// Value written into a scheduling marker
pub const MARKER_VALUE: &str = "wait";
