//! Error types for TALLY operations

use thiserror::Error;

/// Errors raised by the cache-coherence protocol itself.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    #[error("Lock {name} not acquired within {waited_ms}ms")]
    LockTimeout { name: String, waited_ms: u64 },

    #[error("Lease on lock {name} ran out while it was held")]
    LockLost { name: String },

    #[error("Limit exceeded on {field}: attempted {attempted}, bound {bound}")]
    LimitExceeded {
        field: String,
        attempted: f64,
        bound: f64,
    },

    #[error("Invalid amount for {field}: {value}")]
    InvalidAmount { field: String, value: f64 },

    #[error("Bounded mutation of {field} is not allowed in batched mode")]
    TransactionMisuse { field: String },

    #[error("Direct save of cache-fronted record {record} is forbidden")]
    DirectSaveForbidden { record: String },

    #[error("Cached value at {key} is not an integer counter")]
    NotACounter { key: String },

    #[error("Cache substrate failure: {reason}")]
    Substrate { reason: String },
}

/// Backing store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Field access failed for {field} on {record}: {reason}")]
    FieldAccess {
        record: String,
        field: String,
        reason: String,
    },

    #[error("Record not found: {record}")]
    NotFound { record: String },

    #[error("Save failed for {record}: {reason}")]
    SaveFailed { record: String, reason: String },

    #[error("Reconciliation of {record} failed: {reason}")]
    Reconciliation { record: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all TALLY errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TallyError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TallyError {
    /// Lock contention the caller may retry.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, TallyError::Cache(CacheError::LockTimeout { .. }))
    }

    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, TallyError::Cache(CacheError::LimitExceeded { .. }))
    }

    pub fn is_transaction_misuse(&self) -> bool {
        matches!(self, TallyError::Cache(CacheError::TransactionMisuse { .. }))
    }

    pub fn is_field_access(&self) -> bool {
        matches!(self, TallyError::Storage(StorageError::FieldAccess { .. }))
    }
}

/// Result type alias for TALLY operations.
pub type TallyResult<T> = Result<T, TallyError>;

// =============================================================================
// TESTS
// =============================================================================
