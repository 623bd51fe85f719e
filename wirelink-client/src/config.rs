//! Client configuration.
//!
//! One document covers the broker URI, failover tuning, consumer defaults and
//! logging. Options given in the broker URI query override the `[failover]` table.
//!
//! ```toml
//! broker_uri = "failover:(tcp://broker-a:61616,tcp://broker-b:61616)?randomize=false"
//! client_id = "billing"
//! request_timeout_ms = 5000
//!
//! [failover]
//! max_reconnect_attempts = 20
//!
//! [consumer]
//! prefetch_size = 100
//!
//! [logging]
//! level = "wirelink_transport=debug,info"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;
use wirelink_consumer::ConsumerConfig;
use wirelink_core::{
    config::{ConfigLoader, FailoverConfig, FailoverUri, LoggingConfig},
    Result,
};

/// Default broker when none is configured.
pub const DEFAULT_BROKER_URI: &str = "failover:(tcp://localhost:61616)";

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker URI, usually `failover:(...)?options`
    #[validate(length(min = 1))]
    pub broker_uri: String,

    /// Client id announced to the broker; generated when absent
    pub client_id: Option<String>,

    /// User name announced to the broker
    pub user_name: Option<String>,

    /// Bound on synchronous broker requests, in milliseconds
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,

    /// Failover tuning, overridden by URI options
    #[validate(nested)]
    pub failover: FailoverConfig,

    /// Defaults for new consumers
    #[validate(nested)]
    pub consumer: ConsumerConfig,

    /// Logging setup
    #[validate(nested)]
    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_uri: DEFAULT_BROKER_URI.to_string(),
            client_id: None,
            user_name: None,
            request_timeout_ms: 30_000,
            failover: FailoverConfig::default(),
            consumer: ConsumerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Configuration for a broker URI with every other option at its default.
    #[must_use]
    pub fn for_broker(broker_uri: impl Into<String>) -> Self {
        Self { broker_uri: broker_uri.into(), ..Self::default() }
    }

    /// Load from the default search paths and `WIRELINK_*` variables.
    ///
    /// # Errors
    /// Returns [`wirelink_core::Error::Configuration`] for unreadable or invalid sources.
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Broker list and effective failover options.
    ///
    /// # Errors
    /// Returns [`wirelink_core::Error::InvalidUri`] for a malformed broker URI.
    pub fn failover_uri(&self) -> Result<FailoverUri> {
        FailoverUri::parse_with(&self.broker_uri, self.failover.clone())
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
