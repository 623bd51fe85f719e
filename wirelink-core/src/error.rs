//! Error types for the wirelink client library.

use thiserror::Error;

/// Main error type for wirelink operations.
///
/// The type is `Clone` so that a single terminal failure can be handed to every
/// caller blocked on a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// I/O failure on a transport; triggers reconnection when failover is in use
    #[error("Transport I/O error: {message}")]
    TransportIo { message: String },

    /// The transport has been closed and accepts no further work
    #[error("Transport closed: {message}")]
    TransportClosed { message: String },

    /// An operation did not complete before its deadline
    #[error("Operation timed out: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Reconnection gave up after exhausting the configured attempts
    #[error("Connection failed after {attempts} attempts: {message}")]
    ConnectionFailed { attempts: u32, message: String },

    /// The very first connection could not be established within the startup limit
    #[error("Startup connection failed after {attempts} attempts: {message}")]
    StartupFailed { attempts: u32, message: String },

    /// Replaying tracked state onto a fresh transport failed
    #[error("State replay failed: {message}")]
    Replay { message: String },

    /// The consumer has been closed
    #[error("Consumer already closed")]
    ConsumerClosed,

    /// An operation was attempted in a state that does not allow it
    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    /// The broker answered a request with an exception response
    #[error("Broker error: {message}")]
    Broker { message: String },

    /// Malformed frame or unexpected command on the wire
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// A broker URI could not be parsed or uses an unknown scheme
    #[error("Invalid URI {uri}: {message}")]
    InvalidUri { uri: String, message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// The requested capability is not offered by this component
    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },
}

/// Result type alias for wirelink operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a transport I/O failure.
    pub fn io(message: impl Into<String>) -> Self {
        Self::TransportIo { message: message.into() }
    }

    /// Shorthand for a closed-transport failure.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::TransportClosed { message: message.into() }
    }

    /// Shorthand for an illegal-state failure.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState { message: message.into() }
    }

    /// Shorthand for a configuration failure.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Shorthand for a timeout.
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Whether a failover transport should treat this error as a reason to reconnect.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::TransportIo { .. } | Self::Timeout { .. } | Self::Replay { .. })
    }

    /// Whether this error ends the life of the component that raised it.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TransportClosed { .. }
                | Self::ConnectionFailed { .. }
                | Self::StartupFailed { .. }
                | Self::ConsumerClosed
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::TransportIo { message: err.to_string() }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization { message: err.to_string() }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration { message: format!("Failed to parse TOML: {err}") }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Configuration { message: format!("Validation failed: {err}") }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUri { uri: String::new(), message: err.to_string() }
    }
}
