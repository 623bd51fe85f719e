//! Configuration schema definitions.
//!
//! All structures use serde for (de)serialization and validator for field checks.
//! Durations are written as milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Failover transport configuration.
///
/// Field names follow the URI options understood by [`super::FailoverUri`]
/// (`initialReconnectDelay`, `backOffMultiplier`, ...) in snake case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_delays"))]
#[serde(default)]
pub struct FailoverConfig {
    /// Maximum time `oneway`/`request` wait for a transport while disconnected;
    /// `None` waits until connected or closed
    #[serde(with = "duration_ms_opt")]
    pub timeout: Option<Duration>,

    /// First backoff delay
    #[serde(with = "duration_ms")]
    pub initial_reconnect_delay: Duration,

    /// Upper bound for the backoff delay
    #[serde(with = "duration_ms")]
    pub max_reconnect_delay: Duration,

    /// Growth factor of the exponential backoff
    #[validate(range(min = 1.0, max = 100.0))]
    pub backoff_multiplier: f64,

    /// Exponential backoff when true, fixed `reconnect_delay` otherwise
    pub use_exponential_backoff: bool,

    /// Fixed delay between attempts when exponential backoff is disabled
    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,

    /// Reconnect attempts allowed once a connection has been made; `None` is unlimited
    pub max_reconnect_attempts: Option<u32>,

    /// Attempts allowed before the first successful connection; `None` falls back
    /// to unlimited
    pub startup_max_reconnect_attempts: Option<u32>,

    /// Pick candidate brokers in random order
    pub randomize: bool,

    /// Keep pre-connected backup transports
    pub backup: bool,

    /// Number of backup transports to keep
    #[validate(range(min = 1, max = 64))]
    pub backup_pool_size: usize,

    /// Cache one-way messages for replay after reconnect
    pub track_messages: bool,

    /// Replay messages sent inside open transactions
    pub track_transaction_producers: bool,

    /// Maximum number of cached messages when `track_messages` is set
    #[validate(range(min = 1))]
    pub max_cache_size: usize,

    /// Honour broker-directed reconnects
    pub reconnect_supported: bool,

    /// Honour broker-supplied broker lists
    pub update_uris_supported: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            initial_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_exponential_backoff: true,
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_attempts: None,
            startup_max_reconnect_attempts: None,
            randomize: true,
            backup: false,
            backup_pool_size: 1,
            track_messages: false,
            track_transaction_producers: true,
            max_cache_size: 128 * 1024,
            reconnect_supported: true,
            update_uris_supported: true,
        }
    }
}

impl FailoverConfig {
    /// Backoff delay after `failures` consecutive failed connect attempts.
    ///
    /// With exponential backoff: `min(initial * multiplier^failures, max)`. The
    /// counter is incremented before the delay is computed, so the first retry
    /// waits `initial * multiplier` and `failures == 0` gives `initial`.
    /// Otherwise the fixed `reconnect_delay`.
    #[must_use]
    pub fn reconnect_delay_for(&self, failures: u32) -> Duration {
        if !self.use_exponential_backoff {
            return self.reconnect_delay;
        }

        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let initial_ms = self.initial_reconnect_delay.as_millis() as f64;
        let delay_ms = initial_ms * self.backoff_multiplier.powi(exponent);

        #[allow(clippy::cast_precision_loss)]
        let max_ms = self.max_reconnect_delay.as_millis() as f64;
        if !delay_ms.is_finite() || delay_ms >= max_ms {
            return self.max_reconnect_delay;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(delay_ms.round() as u64)
    }

    /// Attempt limit that applies given whether a connection was ever made.
    #[must_use]
    pub const fn attempt_limit(&self, first_connection: bool) -> Option<u32> {
        if first_connection && self.startup_max_reconnect_attempts.is_some() {
            self.startup_max_reconnect_attempts
        } else {
            self.max_reconnect_attempts
        }
    }
}

fn validate_delays(config: &FailoverConfig) -> Result<(), ValidationError> {
    if config.initial_reconnect_delay > config.max_reconnect_delay {
        return Err(ValidationError::new("initial_reconnect_delay_exceeds_max"));
    }
    Ok(())
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `wirelink_transport=debug`
    #[validate(length(min = 1))]
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Include the event target
    pub with_target: bool,

    /// Include thread ids
    pub with_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Text, with_target: true, with_thread_ids: false }
    }
}

/// Helper module for Duration serialization as milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Optional Duration as milliseconds
pub(crate) mod duration_ms_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => {
                serializer.serialize_some(&u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            },
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}
