//! Message type exchanged with the broker.

use crate::types::{Destination, MessageId, TransactionId};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default message priority.
pub const DEFAULT_PRIORITY: u8 = 4;

/// An application message.
///
/// Timestamps are milliseconds since the Unix epoch. An `expiration` of `0` means the
/// message never expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Broker-wide message id, assigned by the producer on send
    pub message_id: Option<MessageId>,

    /// Destination the message was sent to
    pub destination: Destination,

    /// Message body
    pub payload: Bytes,

    /// Application properties
    pub properties: HashMap<String, String>,

    /// Optional correlation id for request/reply patterns
    pub correlation_id: Option<String>,

    /// Send time in milliseconds since the epoch
    pub timestamp: i64,

    /// Absolute expiry time in milliseconds since the epoch, `0` for never
    pub expiration: i64,

    /// Delivery priority (0-9)
    pub priority: u8,

    /// Whether the broker must persist the message
    pub persistent: bool,

    /// Number of times the broker has redelivered this message
    pub redelivery_counter: u32,

    /// Transaction the message was sent under, if any
    pub transaction_id: Option<TransactionId>,
}

impl Message {
    /// Create a new message for a destination.
    pub fn new(destination: Destination, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id: None,
            destination,
            payload: payload.into(),
            properties: HashMap::new(),
            correlation_id: None,
            timestamp: Utc::now().timestamp_millis(),
            expiration: 0,
            priority: DEFAULT_PRIORITY,
            persistent: true,
            redelivery_counter: 0,
            transaction_id: None,
        }
    }

    /// Set a time-to-live relative to the message timestamp.
    #[must_use]
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.set_time_to_live(ttl);
        self
    }

    /// Set an absolute expiration in milliseconds since the epoch.
    #[must_use]
    pub const fn with_expiration(mut self, expiration: i64) -> Self {
        self.expiration = expiration;
        self
    }

    /// Set a time-to-live relative to the message timestamp; zero clears expiry.
    pub fn set_time_to_live(&mut self, ttl: Duration) {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.expiration = if ttl_ms == 0 { 0 } else { self.timestamp.saturating_add(ttl_ms) };
    }

    /// Whether the message has expired according to the wall clock.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp_millis())
    }

    /// Whether the message is expired at the given time (ms since epoch).
    #[must_use]
    pub const fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expiration > 0 && now_ms >= self.expiration
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Payload interpreted as UTF-8 text, if valid.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Get a property value by key.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Add or update a property.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_without_expiry_never_expires() {
        let message = Message::new(Destination::queue("q"), "hello");
        assert_eq!(message.expiration, 0);
        assert!(!message.is_expired());
        assert!(!message.is_expired_at(i64::MAX));
    }

    #[test]
    fn test_expiration_boundary() {
        let message = Message::new(Destination::queue("q"), "hello").with_expiration(1_000);
        assert!(!message.is_expired_at(999));
        assert!(message.is_expired_at(1_000));
        assert!(message.is_expired_at(5_000));
    }

    #[test]
    fn test_time_to_live() {
        let mut message = Message::new(Destination::queue("q"), "hello");
        message.set_time_to_live(Duration::from_secs(60));
        assert_eq!(message.expiration, message.timestamp + 60_000);
        assert!(!message.is_expired());

        message.set_time_to_live(Duration::ZERO);
        assert_eq!(message.expiration, 0);
    }

    #[test]
    fn test_already_expired_message() {
        let message = Message::new(Destination::queue("q"), "late").with_expiration(1);
        assert!(message.is_expired());
    }

    #[test]
    fn test_properties_and_text() {
        let mut message = Message::new(Destination::topic("t"), "body");
        message.set_property("region", "eu");
        assert_eq!(message.property("region"), Some("eu"));
        assert_eq!(message.text(), Some("body"));
        assert_eq!(message.payload_size(), 4);
    }
}
