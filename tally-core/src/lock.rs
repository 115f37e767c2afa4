//! Lock typestate for compile-time safety of lock lifecycle.
//!
//! A named lock handed out by the cache substrate can only be released while
//! it is held, and releasing consumes it.
//!
//! # State Transition Diagram
//!
//! ```text
//! (free) ─── acquire() ──→ Acquired ─── release() ──→ (free)
//!                             │
//!                        extend() ↺
//! ```
//!
//! Every lock carries a lease. A holder that dies without releasing stops
//! blocking others once `expires_at` passes.

use crate::identity::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// LOCK DATA (internal storage, state-independent)
// ============================================================================

/// Data stored by the substrate for a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockData {
    pub name: String,
    /// Token identifying the holder; only the holder may release.
    pub owner: Uuid,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl LockData {
    /// Build lock data for a lease starting at `now`.
    pub fn new(name: impl Into<String>, owner: Uuid, now: Timestamp, lease: Duration) -> Self {
        Self {
            name: name.into(),
            owner,
            acquired_at: now,
            expires_at: now + to_chrono(lease),
        }
    }

    /// Check if the lease has run out.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Remaining lease, or `None` once expired.
    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        if now >= self.expires_at {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::milliseconds(duration.as_millis() as i64))
}

// ============================================================================
// TYPESTATE MARKERS
// ============================================================================

/// Marker trait for lock states.
pub trait LockState: private::Sealed + Send + Sync {}

/// Lock is currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired;
impl LockState for Acquired {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Acquired {}
}

// ============================================================================
// LOCK TYPESTATE WRAPPER
// ============================================================================

/// A named lock with compile-time state tracking.
#[derive(Debug, Clone)]
pub struct Lock<S: LockState> {
    data: LockData,
    _state: PhantomData<S>,
}

impl<S: LockState> Lock<S> {
    pub fn data(&self) -> &LockData {
        &self.data
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn owner(&self) -> Uuid {
        self.data.owner
    }

    pub fn acquired_at(&self) -> Timestamp {
        self.data.acquired_at
    }

    pub fn expires_at(&self) -> Timestamp {
        self.data.expires_at
    }
}

impl Lock<Acquired> {
    /// Wrap data of a lock the substrate just granted.
    pub fn new(data: LockData) -> Self {
        Lock {
            data,
            _state: PhantomData,
        }
    }

    /// Extend the lease. Consumes the handle; the substrate must record the
    /// new expiry too, see `CacheStore::extend_lock`.
    pub fn extend(mut self, additional: Duration) -> Self {
        self.data.expires_at = self.data.expires_at + to_chrono(additional);
        self
    }

    /// Release the lock and return the data the substrate needs to free it.
    pub fn release(self) -> LockData {
        self.data
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.data.is_expired(now)
    }

    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        self.data.remaining_duration(now)
    }
}

/// Errors when transitioning lock states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStateError {
    /// Lock is held by a different owner.
    NotOwner { name: String, owner: Uuid },
    /// Lock lease has run out.
    Expired { name: String, expired_at: Timestamp },
}

impl fmt::Display for LockStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockStateError::NotOwner { name, owner } => {
                write!(f, "Lock {} is not held by {}", name, owner)
            }
            LockStateError::Expired { name, expired_at } => {
                write!(f, "Lock {} expired at {}", name, expired_at)
            }
        }
    }
}

impl std::error::Error for LockStateError {}

/// Validate that stored lock data still belongs to `owner` and is live.
pub fn check_held(data: &LockData, owner: Uuid, now: Timestamp) -> Result<(), LockStateError> {
    if data.owner != owner {
        return Err(LockStateError::NotOwner {
            name: data.name.clone(),
            owner,
        });
    }
    if data.is_expired(now) {
        return Err(LockStateError::Expired {
            name: data.name.clone(),
            expired_at: data.expires_at,
        });
    }
    Ok(())
}
