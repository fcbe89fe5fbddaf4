//! Pool configuration types

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for a [`Pool`](crate::Pool).
///
/// Immutable once the pool is built. `leak_threshold` of
/// [`Duration::ZERO`] disables leak detection entirely, including the
/// borrow-site capture on the hot path.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Name used in logs, events and errors
    pub name: String,
    /// Number of handles the pool keeps alive when load subsides
    pub core_size: usize,
    /// Hard cap on live handles (idle + borrowed)
    pub max_size: usize,
    /// How long `borrow` may wait for a handle
    pub max_wait: Duration,
    /// Idle time after which handles above `core_size` are reaped
    pub max_idle_time: Duration,
    /// Age of the last successful probe after which an idle handle is
    /// probed again before being lent out
    pub validation_interval: Duration,
    /// Probe every idle handle before lending it out
    pub validate_on_borrow: bool,
    /// Probe idle handles from the background validator
    pub validate_while_idle: bool,
    /// Borrow duration after which a handle is reported as leaked
    pub leak_threshold: Duration,
    /// Upper bound on a single validation probe; a slower probe counts as a
    /// failure
    pub validation_timeout: Duration,
    /// Period of the idle reaper
    pub reap_interval: Duration,
    /// Period of the leak detector
    pub leak_scan_interval: Duration,
    /// Period of the idle validator
    pub idle_validation_interval: Duration,
    /// How long shutdown waits for maintenance tasks before aborting them
    pub shutdown_timeout: Duration,
    /// Capture a full backtrace for leak diagnostics (expensive)
    pub capture_backtrace: bool,
    /// Capacity of the lifecycle event channel
    pub event_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            core_size: 1,
            max_size: 10,
            max_wait: Duration::from_secs(30),
            max_idle_time: Duration::from_secs(600),
            validation_interval: Duration::from_secs(30),
            validate_on_borrow: false,
            validate_while_idle: true,
            leak_threshold: Duration::ZERO,
            validation_timeout: Duration::from_secs(1),
            reap_interval: Duration::from_secs(60),
            leak_scan_interval: Duration::from_secs(30),
            idle_validation_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            capture_backtrace: false,
            event_buffer: 1024,
        }
    }
}

impl PoolConfig {
    /// Create a default configuration carrying the given pool name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::configuration("max_size must be greater than 0"));
        }
        if self.core_size > self.max_size {
            return Err(Error::configuration(format!(
                "core_size ({}) must not exceed max_size ({})",
                self.core_size, self.max_size
            )));
        }
        if self.max_wait.is_zero() {
            return Err(Error::configuration("max_wait must be greater than zero"));
        }
        if self.validation_timeout.is_zero() {
            return Err(Error::configuration(
                "validation_timeout must be greater than zero",
            ));
        }
        for (field, interval) in [
            ("reap_interval", self.reap_interval),
            ("leak_scan_interval", self.leak_scan_interval),
            ("idle_validation_interval", self.idle_validation_interval),
        ] {
            if interval.is_zero() {
                return Err(Error::configuration(format!(
                    "{field} must be greater than zero"
                )));
            }
        }
        if self.event_buffer == 0 {
            return Err(Error::configuration("event_buffer must be greater than 0"));
        }
        Ok(())
    }

    /// Whether borrowed handles are tracked for leaks.
    #[must_use]
    pub fn leak_detection_enabled(&self) -> bool {
        !self.leak_threshold.is_zero()
    }

    /// Parse and validate a configuration from JSON. Missing fields take
    /// their default values.
    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::configuration(format!("invalid pool config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}
