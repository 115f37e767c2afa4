//! Runtime configuration for the cache-coherence protocol.
//!
//! Configuration is loaded from environment variables with defaults suitable
//! for production. Tests usually start from `TallyConfig::default()` and
//! shorten the windows through the `with_*` setters.

use crate::constants::*;
use crate::error::{ConfigError, TallyResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing knobs for locking, scheduling and retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyConfig {
    // ========================================================================
    // Locking
    // ========================================================================
    /// Bounded wait when acquiring the record or bound-check lock.
    pub lock_wait: Duration,

    /// Lease on a held lock; an abandoned lock frees itself afterwards.
    pub lock_lease: Duration,

    /// Delay between acquisition attempts while waiting.
    pub lock_poll_interval: Duration,

    // ========================================================================
    // Scheduling windows
    // ========================================================================
    /// Delay of a flush scheduled by a write.
    pub short_delay: Duration,

    /// Lower bound of the randomized delay of a flush scheduled by a cold read.
    pub long_delay_min: Duration,

    /// Upper bound of the randomized delay of a flush scheduled by a cold read.
    pub long_delay_max: Duration,

    /// Extra marker lifetime past its window, so a job lost with its process
    /// cannot suppress rescheduling forever.
    pub marker_grace: Duration,

    // ========================================================================
    // Retries
    // ========================================================================
    /// Backoff before a contended or failed flush runs again.
    pub retry_backoff: Duration,

    /// Lifetime of the job-level overlap guard for one record.
    pub overlap_release_after: Duration,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(DEFAULT_LOCK_WAIT_SECS),
            lock_lease: Duration::from_secs(DEFAULT_LOCK_LEASE_SECS),
            lock_poll_interval: Duration::from_millis(DEFAULT_LOCK_POLL_INTERVAL_MS),
            short_delay: Duration::from_secs(DEFAULT_SHORT_DELAY_SECS),
            long_delay_min: Duration::from_secs(DEFAULT_LONG_DELAY_MIN_SECS),
            long_delay_max: Duration::from_secs(DEFAULT_LONG_DELAY_MAX_SECS),
            marker_grace: Duration::from_secs(DEFAULT_MARKER_GRACE_SECS),
            retry_backoff: Duration::from_secs(DEFAULT_RETRY_BACKOFF_SECS),
            overlap_release_after: Duration::from_secs(DEFAULT_OVERLAP_RELEASE_AFTER_SECS),
        }
    }
}

impl TallyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create TallyConfig from environment variables.
    ///
    /// Environment variables (unset or unparsable values fall back to defaults):
    /// - `TALLY_LOCK_WAIT_SECS` (default: 10)
    /// - `TALLY_LOCK_LEASE_SECS` (default: 60)
    /// - `TALLY_LOCK_POLL_INTERVAL_MS` (default: 25)
    /// - `TALLY_SHORT_DELAY_SECS` (default: 15)
    /// - `TALLY_LONG_DELAY_MIN_SECS` (default: 7200)
    /// - `TALLY_LONG_DELAY_MAX_SECS` (default: 21600)
    /// - `TALLY_MARKER_GRACE_SECS` (default: 600)
    /// - `TALLY_RETRY_BACKOFF_SECS` (default: 30)
    /// - `TALLY_OVERLAP_RELEASE_AFTER_SECS` (default: 60)
    pub fn from_env() -> Self {
        Self {
            lock_wait: env_secs("TALLY_LOCK_WAIT_SECS", DEFAULT_LOCK_WAIT_SECS),
            lock_lease: env_secs("TALLY_LOCK_LEASE_SECS", DEFAULT_LOCK_LEASE_SECS),
            lock_poll_interval: Duration::from_millis(
                std::env::var("TALLY_LOCK_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_LOCK_POLL_INTERVAL_MS),
            ),
            short_delay: env_secs("TALLY_SHORT_DELAY_SECS", DEFAULT_SHORT_DELAY_SECS),
            long_delay_min: env_secs("TALLY_LONG_DELAY_MIN_SECS", DEFAULT_LONG_DELAY_MIN_SECS),
            long_delay_max: env_secs("TALLY_LONG_DELAY_MAX_SECS", DEFAULT_LONG_DELAY_MAX_SECS),
            marker_grace: env_secs("TALLY_MARKER_GRACE_SECS", DEFAULT_MARKER_GRACE_SECS),
            retry_backoff: env_secs("TALLY_RETRY_BACKOFF_SECS", DEFAULT_RETRY_BACKOFF_SECS),
            overlap_release_after: env_secs(
                "TALLY_OVERLAP_RELEASE_AFTER_SECS",
                DEFAULT_OVERLAP_RELEASE_AFTER_SECS,
            ),
        }
    }

    /// Reject configurations the protocol cannot run with.
    pub fn validate(&self) -> TallyResult<()> {
        if self.lock_wait.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "lock_wait".to_string(),
                value: "0".to_string(),
                reason: "a zero wait makes every contended operation time out".to_string(),
            }
            .into());
        }
        if self.lock_poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "lock_poll_interval".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        if self.lock_lease < self.lock_wait {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "lock_lease".to_string(),
                option_b: "lock_wait".to_string(),
            }
            .into());
        }
        if self.long_delay_min > self.long_delay_max {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "long_delay_min".to_string(),
                option_b: "long_delay_max".to_string(),
            }
            .into());
        }
        if self.retry_backoff.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "retry_backoff".to_string(),
                value: "0".to_string(),
                reason: "a rescheduled flush would spin".to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    pub fn with_short_delay(mut self, delay: Duration) -> Self {
        self.short_delay = delay;
        self
    }

    pub fn with_long_delay(mut self, min: Duration, max: Duration) -> Self {
        self.long_delay_min = min;
        self.long_delay_max = max;
        self
    }

    pub fn with_marker_grace(mut self, grace: Duration) -> Self {
        self.marker_grace = grace;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_overlap_release_after(mut self, release_after: Duration) -> Self {
        self.overlap_release_after = release_after;
        self
    }
}

fn env_secs(var: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(var)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TallyError;

    #[test]
    fn test_default_config_is_valid() {
        let config = TallyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lock_wait, Duration::from_secs(10));
        assert_eq!(config.retry_backoff, Duration::from_secs(30));
        assert_eq!(config.overlap_release_after, Duration::from_secs(60));
    }

    #[test]
    fn test_config_builder() {
        let config = TallyConfig::new()
            .with_lock_wait(Duration::from_secs(2))
            .with_short_delay(Duration::from_secs(1))
            .with_long_delay(Duration::from_secs(10), Duration::from_secs(20))
            .with_retry_backoff(Duration::from_secs(3));

        assert_eq!(config.lock_wait, Duration::from_secs(2));
        assert_eq!(config.short_delay, Duration::from_secs(1));
        assert_eq!(config.long_delay_min, Duration::from_secs(10));
        assert_eq!(config.long_delay_max, Duration::from_secs(20));
        assert_eq!(config.retry_backoff, Duration::from_secs(3));
    }

    #[test]
    fn test_validate_rejects_inverted_long_window() {
        let config = TallyConfig::new()
            .with_long_delay(Duration::from_secs(20), Duration::from_secs(10));
        assert!(matches!(
            config.validate(),
            Err(TallyError::Config(ConfigError::IncompatibleOptions { .. }))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_wait() {
        let config = TallyConfig::new().with_lock_wait(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_env_falls_back_to_defaults() {
        // Variables are read but none of these names are set in CI.
        let config = TallyConfig::from_env();
        assert!(config.validate().is_ok());
    }
}
