//! Configuration surface consumed by the lock manager and listener wrapper.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shortest lease period accepted by every supported backend.
pub const MIN_LOCK_PERIOD: Duration = Duration::from_secs(15);

/// Longest non-infinite lease period accepted by every supported backend.
pub const MAX_LOCK_PERIOD: Duration = Duration::from_secs(60);

/// Configuration rejected by [`SingletonConfig::validate`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A duration fell outside its accepted range.
    #[error("{name} must be between {min:?} and {max:?}, got {actual:?}")]
    OutOfRange {
        /// Name of the offending setting.
        name: &'static str,
        /// Lower bound (inclusive).
        min: Duration,
        /// Upper bound (inclusive).
        max: Duration,
        /// Value provided.
        actual: Duration,
    },

    /// A duration that must be positive was zero.
    #[error("{name} must be non-zero")]
    Zero {
        /// Name of the offending setting.
        name: &'static str,
    },
}

/// Timing knobs for lock acquisition, renewal, and listener recovery.
///
/// Lock periods are bounded to the range every backend accepts, so one
/// configuration works unchanged against blob and Kubernetes stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SingletonConfig {
    /// Lease period for function-scoped locks.
    pub lock_period: Duration,

    /// Lease period for listener-scoped locks.
    pub listener_lock_period: Duration,

    /// How long the blocking acquisition path polls before giving up.
    pub acquisition_timeout: Duration,

    /// Delay between acquisition attempts while another holder owns the lock.
    pub acquisition_poll_interval: Duration,

    /// Floor for the renewal timer's delay; prevents runaway rapid renewal
    /// when the lease period is small.
    pub minimum_renewal_interval: Duration,

    /// Cadence of the listener wrapper's recovery poll after a failed
    /// initial acquisition. `None` disables recovery entirely, making a
    /// failed initial acquisition final.
    pub listener_recovery_poll_interval: Option<Duration>,
}

impl Default for SingletonConfig {
    fn default() -> Self {
        Self {
            lock_period: Duration::from_secs(15),
            listener_lock_period: Duration::from_secs(60),
            acquisition_timeout: Duration::from_secs(60),
            acquisition_poll_interval: Duration::from_secs(5),
            minimum_renewal_interval: Duration::from_secs(1),
            listener_recovery_poll_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl SingletonConfig {
    /// Check all settings against their accepted ranges.
    ///
    /// # Errors
    /// Returns `ConfigError` for the first setting out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, period) in [
            ("lock_period", self.lock_period),
            ("listener_lock_period", self.listener_lock_period),
        ] {
            if period < MIN_LOCK_PERIOD || period > MAX_LOCK_PERIOD {
                return Err(ConfigError::OutOfRange {
                    name,
                    min: MIN_LOCK_PERIOD,
                    max: MAX_LOCK_PERIOD,
                    actual: period,
                });
            }
        }

        for (name, value) in [
            ("acquisition_timeout", self.acquisition_timeout),
            ("acquisition_poll_interval", self.acquisition_poll_interval),
            ("minimum_renewal_interval", self.minimum_renewal_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero { name });
            }
        }

        if let Some(interval) = self.listener_recovery_poll_interval {
            if interval.is_zero() {
                return Err(ConfigError::Zero {
                    name: "listener_recovery_poll_interval",
                });
            }
        }

        Ok(())
    }
}
