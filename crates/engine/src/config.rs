//! Engine configuration
//!
//! All values are plain integers of seconds or counts. Validation happens at
//! configuration time so misconfiguration never surfaces mid-batch.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Inclusive `[min, max]` range of whole seconds
///
/// Either bound being `0` means "no delay".
///
/// # Example
///
/// ```
/// use fleetrun_engine::DelayRange;
///
/// let range = DelayRange::new(2, 5).unwrap();
/// assert!(!range.is_disabled());
/// assert!(DelayRange::new(10, 3).is_err());
/// ```
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelayRange {
    /// Lower bound in seconds
    pub min_secs: u64,

    /// Upper bound in seconds
    pub max_secs: u64,
}

impl DelayRange {
    /// Create a validated range
    pub fn new(min_secs: u64, max_secs: u64) -> Result<Self, ConfigError> {
        let range = Self { min_secs, max_secs };
        range.validate()?;
        Ok(range)
    }

    /// A range that never waits
    pub fn none() -> Self {
        Self::default()
    }

    /// A range that always waits exactly `secs`
    pub fn fixed(secs: u64) -> Self {
        Self {
            min_secs: secs,
            max_secs: secs,
        }
    }

    /// Check `min <= max`
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_secs > self.max_secs {
            return Err(ConfigError::InvalidRange {
                min: self.min_secs,
                max: self.max_secs,
            });
        }
        Ok(())
    }

    /// True when either bound is zero
    pub fn is_disabled(&self) -> bool {
        self.min_secs == 0 || self.max_secs == 0
    }
}

/// Rate-limit escalation configuration
///
/// # Example
///
/// ```
/// use fleetrun_engine::RateLimitConfig;
///
/// let config = RateLimitConfig::default()
///     .with_threshold(20)
///     .with_long_wait_secs(1800);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Consecutive wait-limit hits that declare an emergency
    pub threshold: u32,

    /// Consecutive flood-style hits that declare an emergency
    pub flood_threshold: u32,

    /// A single wait longer than this is an emergency on its own
    pub long_wait_secs: u64,

    /// Wait assumed when a rate-limit message carries no number
    pub fallback_wait_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            threshold: 15,
            flood_threshold: 10,
            long_wait_secs: 3600,
            fallback_wait_secs: 5,
        }
    }
}

impl RateLimitConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the consecutive-hit threshold
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the flood-hit threshold
    pub fn with_flood_threshold(mut self, threshold: u32) -> Self {
        self.flood_threshold = threshold;
        self
    }

    /// Set the long-wait threshold
    pub fn with_long_wait_secs(mut self, secs: u64) -> Self {
        self.long_wait_secs = secs;
        self
    }

    /// Set the fallback wait for messages without a number
    pub fn with_fallback_wait_secs(mut self, secs: u64) -> Self {
        self.fallback_wait_secs = secs;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold == 0 {
            return Err(invalid("threshold", "must be at least 1"));
        }
        if self.flood_threshold == 0 {
            return Err(invalid("flood_threshold", "must be at least 1"));
        }
        if self.long_wait_secs == 0 {
            return Err(invalid("long_wait_secs", "must be at least 1"));
        }
        Ok(())
    }
}

/// Top-level configuration for a batch
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Stagger between worker launches
    pub launch_delay: DelayRange,

    /// Pacing delay each worker applies between its own actions
    pub action_delay: DelayRange,

    /// Rate-limit policy settings
    pub rate_limit: RateLimitConfig,

    /// Stop every worker as soon as an emergency is declared
    #[serde(default)]
    pub stop_on_emergency: bool,
}

impl EngineConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    ///
    /// Unset or unparsable variables keep their defaults; the result is
    /// validated before it is returned.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            launch_delay: DelayRange {
                min_secs: env_or("FLEETRUN_LAUNCH_DELAY_MIN", defaults.launch_delay.min_secs),
                max_secs: env_or("FLEETRUN_LAUNCH_DELAY_MAX", defaults.launch_delay.max_secs),
            },
            action_delay: DelayRange {
                min_secs: env_or("FLEETRUN_ACTION_DELAY_MIN", defaults.action_delay.min_secs),
                max_secs: env_or("FLEETRUN_ACTION_DELAY_MAX", defaults.action_delay.max_secs),
            },
            rate_limit: RateLimitConfig {
                threshold: env_or(
                    "FLEETRUN_RATE_LIMIT_THRESHOLD",
                    defaults.rate_limit.threshold,
                ),
                flood_threshold: env_or(
                    "FLEETRUN_FLOOD_THRESHOLD",
                    defaults.rate_limit.flood_threshold,
                ),
                long_wait_secs: env_or("FLEETRUN_LONG_WAIT_SECS", defaults.rate_limit.long_wait_secs),
                fallback_wait_secs: defaults.rate_limit.fallback_wait_secs,
            },
            stop_on_emergency: env_or("FLEETRUN_STOP_ON_EMERGENCY", defaults.stop_on_emergency),
        };

        config.validate()?;
        Ok(config)
    }

    /// Set the launch stagger range
    pub fn with_launch_delay(mut self, range: DelayRange) -> Self {
        self.launch_delay = range;
        self
    }

    /// Set the per-action pacing range
    pub fn with_action_delay(mut self, range: DelayRange) -> Self {
        self.action_delay = range;
        self
    }

    /// Set the rate-limit configuration
    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    /// Stop all workers automatically on emergency
    pub fn with_stop_on_emergency(mut self, enabled: bool) -> Self {
        self.stop_on_emergency = enabled;
        self
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.launch_delay.validate()?;
        self.action_delay.validate()?;
        self.rate_limit.validate()
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
