//! Identifier types and connection-scoped id generation.
//!
//! Ids nest the way broker state nests: a [`ConsumerId`] embeds its [`SessionId`],
//! which embeds its [`ConnectionId`]. Parent/child relations are therefore derivable
//! from the ids alone, which the state tracker relies on when cascading removals.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use uuid::Uuid;

/// Unique identifier for a logical client connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection id from an explicit value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a new, globally unique connection id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("ID:{}", Uuid::new_v4()))
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a session within a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    /// Owning connection
    pub connection_id: ConnectionId,
    /// Connection-scoped sequence value
    pub value: u64,
}

impl SessionId {
    /// Create a session id.
    #[must_use]
    pub const fn new(connection_id: ConnectionId, value: u64) -> Self {
        Self { connection_id, value }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.value)
    }
}

/// Identifier of a consumer within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId {
    /// Owning session
    pub session_id: SessionId,
    /// Connection-scoped sequence value
    pub value: u64,
}

impl ConsumerId {
    /// Create a consumer id.
    #[must_use]
    pub const fn new(session_id: SessionId, value: u64) -> Self {
        Self { session_id, value }
    }

    /// The connection this consumer ultimately belongs to.
    #[must_use]
    pub const fn connection_id(&self) -> &ConnectionId {
        &self.session_id.connection_id
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.value)
    }
}

/// Identifier of a producer within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId {
    /// Owning session
    pub session_id: SessionId,
    /// Connection-scoped sequence value
    pub value: u64,
}

impl ProducerId {
    /// Create a producer id.
    #[must_use]
    pub const fn new(session_id: SessionId, value: u64) -> Self {
        Self { session_id, value }
    }

    /// The connection this producer ultimately belongs to.
    #[must_use]
    pub const fn connection_id(&self) -> &ConnectionId {
        &self.session_id.connection_id
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.value)
    }
}

/// Identifier of a local transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    /// Connection that began the transaction
    pub connection_id: ConnectionId,
    /// Connection-scoped sequence value
    pub value: u64,
}

impl TransactionId {
    /// Create a transaction id.
    #[must_use]
    pub const fn new(connection_id: ConnectionId, value: u64) -> Self {
        Self { connection_id, value }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TX:{}:{}", self.connection_id, self.value)
    }
}

/// Identifier of a message: the producer that sent it plus a producer sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    /// Producer that sent the message
    pub producer_id: ProducerId,
    /// Producer-scoped sequence number
    pub sequence: u64,
}

impl MessageId {
    /// Create a message id.
    #[must_use]
    pub const fn new(producer_id: ProducerId, sequence: u64) -> Self {
        Self { producer_id, sequence }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer_id, self.sequence)
    }
}

/// A broker destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Point-to-point queue
    Queue(String),
    /// Publish/subscribe topic
    Topic(String),
}

impl Destination {
    /// Convenience constructor for a queue.
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue(name.into())
    }

    /// Convenience constructor for a topic.
    pub fn topic(name: impl Into<String>) -> Self {
        Self::Topic(name.into())
    }

    /// Physical name of the destination.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Queue(name) | Self::Topic(name) => name,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(name) => write!(f, "queue://{name}"),
            Self::Topic(name) => write!(f, "topic://{name}"),
        }
    }
}

/// How a session acknowledges consumed messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AcknowledgeMode {
    /// Every message is acknowledged as soon as it has been consumed
    #[default]
    AutoAcknowledge,
    /// Lazy acknowledgement; duplicates are tolerated
    DupsOkAcknowledge,
    /// The application acknowledges explicitly
    ClientAcknowledge,
    /// The application acknowledges each message individually
    IndividualAcknowledge,
    /// Acknowledgements are scoped to the session's transaction
    Transacted,
}

impl AcknowledgeMode {
    /// Whether consumption itself triggers the acknowledgement.
    #[must_use]
    pub const fn acks_on_consume(self) -> bool {
        matches!(self, Self::AutoAcknowledge | Self::DupsOkAcknowledge)
    }
}

/// Connection-owned id generator.
///
/// Counters live with the connection rather than in process-wide state, so two
/// connections in one process never share sequences.
#[derive(Debug)]
pub struct IdGenerator {
    connection_id: ConnectionId,
    sessions: AtomicU64,
    consumers: AtomicU64,
    producers: AtomicU64,
    transactions: AtomicU64,
    commands: AtomicU32,
}

impl IdGenerator {
    /// Create a generator for the given connection.
    #[must_use]
    pub const fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            sessions: AtomicU64::new(1),
            consumers: AtomicU64::new(1),
            producers: AtomicU64::new(1),
            transactions: AtomicU64::new(1),
            commands: AtomicU32::new(1),
        }
    }

    /// The connection id every generated id hangs off.
    #[must_use]
    pub const fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Next session id.
    pub fn next_session_id(&self) -> SessionId {
        SessionId::new(self.connection_id.clone(), self.sessions.fetch_add(1, Ordering::Relaxed))
    }

    /// Next consumer id in the given session.
    pub fn next_consumer_id(&self, session_id: &SessionId) -> ConsumerId {
        ConsumerId::new(session_id.clone(), self.consumers.fetch_add(1, Ordering::Relaxed))
    }

    /// Next producer id in the given session.
    pub fn next_producer_id(&self, session_id: &SessionId) -> ProducerId {
        ProducerId::new(session_id.clone(), self.producers.fetch_add(1, Ordering::Relaxed))
    }

    /// Next local transaction id.
    pub fn next_transaction_id(&self) -> TransactionId {
        TransactionId::new(
            self.connection_id.clone(),
            self.transactions.fetch_add(1, Ordering::Relaxed),
        )
    }

    /// Next command id.
    pub fn next_command_id(&self) -> u32 {
        self.commands.fetch_add(1, Ordering::Relaxed)
    }
}
