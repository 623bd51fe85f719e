//! # Transport Contract
//!
//! A transport is an opaque bidirectional command channel to one broker. Upper
//! layers send through [`Transport`] and receive inbound commands and failures
//! through the [`TransportListener`] installed with [`Transport::set_listener`].
//!
//! Concrete transports form a closed set selected by URI scheme through
//! [`TransportFactory`]. Callers that need a concrete capability narrow with
//! [`Transport::as_failover`] or [`Transport::as_mock`] instead of probing types.

use crate::failover::FailoverTransport;
use crate::mock::{MockNetwork, MockTransport};
use crate::tcp::TcpTransport;
use async_trait::async_trait;
use std::{fmt, sync::Arc, time::Duration};
use tracing::debug;
use url::Url;
use wirelink_core::{Command, Error, Result};

/// Receives inbound traffic and lifecycle events from a transport.
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// A command arrived from the broker.
    async fn on_command(&self, command: Command);

    /// The transport failed; it will not deliver further commands.
    async fn on_exception(&self, error: Error);

    /// A fault-tolerant transport lost its connection and is reconnecting.
    async fn transport_interrupted(&self) {}

    /// A fault-tolerant transport reconnected and replayed its state.
    async fn transport_resumed(&self) {}
}

/// Bidirectional command channel to a broker.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Begin delivering inbound commands to the listener.
    async fn start(&self) -> Result<()>;

    /// Stop background activity without releasing the connection.
    async fn stop(&self) -> Result<()>;

    /// Release the connection. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Send a command without waiting for a response.
    async fn oneway(&self, command: Command) -> Result<()>;

    /// Send a command and wait for the correlated response.
    ///
    /// A command id of `0` is replaced by a transport-assigned id. `timeout` bounds
    /// the wait for the response; `None` waits until the response arrives or the
    /// transport fails.
    async fn request(&self, command: Command, timeout: Option<Duration>) -> Result<Command>;

    /// Install the listener for inbound commands and failures, replacing any other.
    fn set_listener(&self, listener: Arc<dyn TransportListener>);

    /// Whether the transport currently has a live connection.
    fn is_connected(&self) -> bool;

    /// Whether the transport has been closed.
    fn is_closed(&self) -> bool;

    /// Whether the transport survives broker failures on its own.
    fn is_fault_tolerant(&self) -> bool {
        false
    }

    /// Address of the connected broker, if any.
    fn remote_address(&self) -> Option<String>;

    /// Which concrete transport this is.
    fn kind(&self) -> TransportKind;

    /// Narrow to the failover transport.
    fn as_failover(&self) -> Option<&FailoverTransport> {
        None
    }

    /// Narrow to the in-memory mock transport.
    fn as_mock(&self) -> Option<&MockTransport> {
        None
    }
}

/// The closed set of transport implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// TCP socket carrying framed commands
    Tcp,
    /// In-memory transport attached to a [`MockNetwork`]
    Mock,
    /// Reconnecting wrapper around the other kinds
    Failover,
}

impl TransportKind {
    /// Select the transport kind for a broker URI.
    ///
    /// # Errors
    /// Returns [`Error::InvalidUri`] for schemes without a transport.
    pub fn from_uri(uri: &Url) -> Result<Self> {
        match uri.scheme() {
            "tcp" => Ok(Self::Tcp),
            "mock" => Ok(Self::Mock),
            "failover" => Ok(Self::Failover),
            other => Err(Error::InvalidUri {
                uri: uri.to_string(),
                message: format!("no transport for scheme '{other}'"),
            }),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Mock => write!(f, "mock"),
            Self::Failover => write!(f, "failover"),
        }
    }
}

/// Creates connected transports for broker URIs.
///
/// `mock://` URIs resolve against the attached [`MockNetwork`]; without one they
/// are rejected.
#[derive(Debug, Clone, Default)]
pub struct TransportFactory {
    mock_network: Option<MockNetwork>,
}

impl TransportFactory {
    /// Factory for real transports only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory that also resolves `mock://` URIs on the given network.
    #[must_use]
    pub fn with_mock_network(network: MockNetwork) -> Self {
        Self { mock_network: Some(network) }
    }

    /// Connect and start a transport for a single broker URI.
    ///
    /// The returned transport has no listener; inbound commands are dropped until
    /// one is installed.
    ///
    /// # Errors
    /// Returns [`Error::InvalidUri`] for unsupported schemes (including nested
    /// `failover:` URIs) and [`Error::TransportIo`] when the connection fails.
    pub async fn connect(&self, uri: &Url) -> Result<Arc<dyn Transport>> {
        debug!("Connecting transport to {uri}");
        let transport: Arc<dyn Transport> = match TransportKind::from_uri(uri)? {
            TransportKind::Tcp => TcpTransport::connect(uri).await? as Arc<dyn Transport>,
            TransportKind::Mock => match &self.mock_network {
                Some(network) => network.connect(uri)? as Arc<dyn Transport>,
                None => {
                    return Err(Error::InvalidUri {
                        uri: uri.to_string(),
                        message: "mock transport requested without a mock network".to_string(),
                    })
                },
            },
            TransportKind::Failover => {
                return Err(Error::InvalidUri {
                    uri: uri.to_string(),
                    message: "failover URIs cannot be nested".to_string(),
                })
            },
        };

        transport.start().await?;
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_scheme() {
        let tcp = Url::parse("tcp://localhost:61616").unwrap();
        let mock = Url::parse("mock://broker-a").unwrap();
        let http = Url::parse("http://localhost").unwrap();

        assert_eq!(TransportKind::from_uri(&tcp).unwrap(), TransportKind::Tcp);
        assert_eq!(TransportKind::from_uri(&mock).unwrap(), TransportKind::Mock);
        assert!(matches!(TransportKind::from_uri(&http), Err(Error::InvalidUri { .. })));
    }

    #[tokio::test]
    async fn test_mock_scheme_requires_network() {
        let factory = TransportFactory::new();
        let uri = Url::parse("mock://broker-a").unwrap();
        assert!(matches!(factory.connect(&uri).await, Err(Error::InvalidUri { .. })));
    }

    #[tokio::test]
    async fn test_mock_connect_starts_transport() {
        let network = MockNetwork::new();
        network.register_host("broker-a");
        let factory = TransportFactory::with_mock_network(network.clone());

        let transport = factory.connect(&Url::parse("mock://broker-a").unwrap()).await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(transport.kind(), TransportKind::Mock);
        assert!(transport.as_mock().is_some());
        assert!(transport.as_failover().is_none());
        assert_eq!(network.connect_attempts(), vec!["broker-a".to_string()]);
    }
}
