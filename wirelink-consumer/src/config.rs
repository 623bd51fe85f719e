//! Consumer configuration types.

use serde::{Deserialize, Serialize};
use validator::Validate;
use wirelink_core::{command::ConsumerInfo, ConsumerId, Destination};

/// Largest prefetch window a broker accepts.
pub const MAX_PREFETCH_SIZE: u32 = 32_767;

/// Default prefetch window for queue consumers.
pub const DEFAULT_PREFETCH_SIZE: u32 = 1000;

/// Subscription options for a message consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Messages the broker may push ahead of acknowledgement; `0` makes the
    /// consumer pull one message per receive
    #[validate(range(max = 32767))]
    pub prefetch_size: u32,

    /// Message selector
    pub selector: Option<String>,

    /// Suppress messages published on the consumer's own connection
    pub no_local: bool,

    /// Request exclusive delivery on a queue
    pub exclusive: bool,

    /// Consumer priority
    #[validate(range(max = 127))]
    pub priority: u8,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { prefetch_size: DEFAULT_PREFETCH_SIZE, selector: None, no_local: false, exclusive: false, priority: 0 }
    }
}

impl ConsumerConfig {
    /// Configuration for a zero-prefetch (pull) consumer.
    #[must_use]
    pub fn pull() -> Self {
        Self { prefetch_size: 0, ..Self::default() }
    }

    /// Subscription command body for a consumer with these options.
    #[must_use]
    pub fn consumer_info(&self, consumer_id: ConsumerId, destination: Destination) -> ConsumerInfo {
        ConsumerInfo {
            selector: self.selector.clone(),
            no_local: self.no_local,
            exclusive: self.exclusive,
            priority: self.priority,
            ..ConsumerInfo::new(consumer_id, destination, self.prefetch_size.min(MAX_PREFETCH_SIZE))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirelink_core::{ConnectionId, SessionId};

    #[test]
    fn test_defaults_are_valid() {
        let config = ConsumerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.prefetch_size, DEFAULT_PREFETCH_SIZE);
    }

    #[test]
    fn test_oversized_prefetch_is_rejected() {
        let config = ConsumerConfig { prefetch_size: MAX_PREFETCH_SIZE + 1, ..ConsumerConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_consumer_info_carries_options() {
        let session = SessionId::new(ConnectionId::new("c"), 1);
        let config = ConsumerConfig { selector: Some("color = 'red'".into()), exclusive: true, ..ConsumerConfig::pull() };

        let info = config.consumer_info(ConsumerId::new(session, 7), Destination::queue("q"));
        assert_eq!(info.prefetch_size, 0);
        assert_eq!(info.selector.as_deref(), Some("color = 'red'"));
        assert!(info.exclusive);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ConsumerConfig = toml::from_str("prefetch_size = 5").unwrap();
        assert_eq!(config.prefetch_size, 5);
        assert!(!config.no_local);
    }
}
