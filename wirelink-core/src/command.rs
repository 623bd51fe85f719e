//! Commands exchanged between client and broker.
//!
//! Every command travels inside a [`Command`] envelope carrying a command id and a
//! `response_required` flag. The broker answers response-required commands with a
//! [`Response`] (or [`ExceptionResponse`]) whose `correlation_id` equals the request's
//! `command_id`.

use crate::message::Message;
use crate::types::{
    ConnectionId, ConsumerId, Destination, MessageId, ProducerId, SessionId, TransactionId,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Envelope for every command on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Sender-assigned id, used to correlate responses
    pub command_id: u32,
    /// Whether the receiver must answer with a response
    pub response_required: bool,
    /// The command body
    pub kind: CommandKind,
}

impl Command {
    /// Wrap a command body; no response required.
    #[must_use]
    pub const fn new(kind: CommandKind) -> Self {
        Self { command_id: 0, response_required: false, kind }
    }

    /// Mark the command as requiring a response.
    #[must_use]
    pub const fn with_response_required(mut self) -> Self {
        self.response_required = true;
        self
    }

    /// Set the command id.
    #[must_use]
    pub const fn with_command_id(mut self, command_id: u32) -> Self {
        self.command_id = command_id;
        self
    }

    /// Build a response correlated to this command.
    #[must_use]
    pub const fn response(&self) -> Self {
        Self::new(CommandKind::Response(Response { correlation_id: self.command_id }))
    }

    /// Whether this is a response of either kind.
    #[must_use]
    pub const fn is_response(&self) -> bool {
        matches!(self.kind, CommandKind::Response(_) | CommandKind::ExceptionResponse(_))
    }

    /// Correlation id if this is a response.
    #[must_use]
    pub const fn correlation_id(&self) -> Option<u32> {
        match &self.kind {
            CommandKind::Response(response) => Some(response.correlation_id),
            CommandKind::ExceptionResponse(response) => Some(response.correlation_id),
            _ => None,
        }
    }

    /// Whether this command tears down broker-side state.
    ///
    /// Such commands need not wait for a reconnect: a dead connection already lost
    /// whatever they would remove.
    #[must_use]
    pub const fn is_shutdown_command(&self) -> bool {
        matches!(self.kind, CommandKind::RemoveInfo(_) | CommandKind::ShutdownInfo)
    }

    /// Short name of the command type, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.kind.name()
    }
}

impl From<CommandKind> for Command {
    fn from(kind: CommandKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[id={}, response_required={}]", self.name(), self.command_id, self.response_required)
    }
}

/// Command bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Open a connection
    ConnectionInfo(ConnectionInfo),
    /// Open a session
    SessionInfo(SessionInfo),
    /// Subscribe a consumer
    ConsumerInfo(ConsumerInfo),
    /// Register a producer
    ProducerInfo(ProducerInfo),
    /// Transaction control
    TransactionInfo(TransactionInfo),
    /// Remove a connection, session, consumer or producer
    RemoveInfo(RemoveInfo),
    /// A message sent by a producer
    Message(Box<Message>),
    /// A message delivered to a consumer
    MessageDispatch(MessageDispatch),
    /// Consumer acknowledgement
    MessageAck(MessageAck),
    /// Pull request from a zero-prefetch consumer
    MessagePull(MessagePull),
    /// Broker-directed reconnect / topology update
    ConnectionControl(ConnectionControl),
    /// The peer is closing the connection on purpose
    ShutdownInfo,
    /// Inactivity keep-alive
    KeepAliveInfo,
    /// Successful response
    Response(Response),
    /// Failed response
    ExceptionResponse(ExceptionResponse),
}

impl CommandKind {
    /// Short name of the command type.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ConnectionInfo(_) => "ConnectionInfo",
            Self::SessionInfo(_) => "SessionInfo",
            Self::ConsumerInfo(_) => "ConsumerInfo",
            Self::ProducerInfo(_) => "ProducerInfo",
            Self::TransactionInfo(_) => "TransactionInfo",
            Self::RemoveInfo(_) => "RemoveInfo",
            Self::Message(_) => "Message",
            Self::MessageDispatch(_) => "MessageDispatch",
            Self::MessageAck(_) => "MessageAck",
            Self::MessagePull(_) => "MessagePull",
            Self::ConnectionControl(_) => "ConnectionControl",
            Self::ShutdownInfo => "ShutdownInfo",
            Self::KeepAliveInfo => "KeepAliveInfo",
            Self::Response(_) => "Response",
            Self::ExceptionResponse(_) => "ExceptionResponse",
        }
    }
}

/// Connection registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Connection id
    pub connection_id: ConnectionId,
    /// Client id, unique per broker
    pub client_id: String,
    /// Optional credentials
    pub user_name: Option<String>,
    /// Whether the client sits on a fault-tolerant transport
    pub fault_tolerant: bool,
}

/// Session registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session id
    pub session_id: SessionId,
}

/// Consumer subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    /// Consumer id
    pub consumer_id: ConsumerId,
    /// Subscribed destination
    pub destination: Destination,
    /// Broker-side prefetch window; `0` means the consumer pulls
    pub prefetch_size: u32,
    /// Optional message selector
    pub selector: Option<String>,
    /// Durable subscription name
    pub subscription_name: Option<String>,
    /// Suppress messages published on the same connection
    pub no_local: bool,
    /// Exclusive queue consumer
    pub exclusive: bool,
    /// Consumer priority
    pub priority: u8,
}

impl ConsumerInfo {
    /// Create consumer info with default flags.
    #[must_use]
    pub const fn new(consumer_id: ConsumerId, destination: Destination, prefetch_size: u32) -> Self {
        Self {
            consumer_id,
            destination,
            prefetch_size,
            selector: None,
            subscription_name: None,
            no_local: false,
            exclusive: false,
            priority: 0,
        }
    }
}

/// Producer registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    /// Producer id
    pub producer_id: ProducerId,
    /// Fixed destination, if any
    pub destination: Option<Destination>,
}

/// Transaction control operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    /// Start a transaction
    Begin,
    /// Two-phase prepare
    Prepare,
    /// Single-phase commit
    CommitOnePhase,
    /// Two-phase commit
    CommitTwoPhase,
    /// Roll back
    Rollback,
    /// Forget a heuristically completed transaction
    Forget,
    /// End association
    End,
}

impl TransactionType {
    /// Whether this operation completes the transaction.
    #[must_use]
    pub const fn completes(self) -> bool {
        matches!(
            self,
            Self::CommitOnePhase | Self::CommitTwoPhase | Self::Rollback | Self::Forget | Self::End
        )
    }
}

/// Transaction control command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    /// Connection owning the transaction
    pub connection_id: ConnectionId,
    /// Transaction id
    pub transaction_id: TransactionId,
    /// Operation
    pub kind: TransactionType,
}

/// Broker-side object addressed by a [`RemoveInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectId {
    /// A connection
    Connection(ConnectionId),
    /// A session
    Session(SessionId),
    /// A consumer
    Consumer(ConsumerId),
    /// A producer
    Producer(ProducerId),
}

/// Removal of a broker-side object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveInfo {
    /// Object to remove
    pub object_id: ObjectId,
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDispatch {
    /// Target consumer
    pub consumer_id: ConsumerId,
    /// Destination the message came from
    pub destination: Destination,
    /// The message
    pub message: Box<Message>,
    /// Broker redelivery counter for this dispatch
    pub redelivery_counter: u32,
}

/// Acknowledgement types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckType {
    /// Delivered but not yet consumed; keeps prefetch flowing
    Delivered,
    /// Processing failed permanently
    Poison,
    /// Consumed; the broker may discard the message
    Consumed,
    /// Scheduled for redelivery
    Redelivered,
    /// Individual acknowledgement of one message
    Individual,
}

/// Consumer acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    /// Acknowledgement type
    pub ack_type: AckType,
    /// Acknowledging consumer
    pub consumer_id: ConsumerId,
    /// Destination of the acknowledged messages
    pub destination: Destination,
    /// First message of the acknowledged range
    pub first_message_id: MessageId,
    /// Last message of the acknowledged range
    pub last_message_id: MessageId,
    /// Number of messages in the range
    pub message_count: u32,
    /// Transaction scoping the acknowledgement
    pub transaction_id: Option<TransactionId>,
}

/// Pull request for a zero-prefetch consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePull {
    /// Pulling consumer
    pub consumer_id: ConsumerId,
    /// Destination to pull from
    pub destination: Destination,
    /// Broker wait in milliseconds: `0` waits indefinitely, `-1` does not wait
    pub timeout: i64,
}

/// Broker-directed connection control.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionControl {
    /// Broker asks the client to close
    pub close: bool,
    /// Broker asks the client to exit
    pub exit: bool,
    /// Broker reports it supports fault-tolerant clients
    pub fault_tolerant: bool,
    /// Resume dispatch
    pub resume: bool,
    /// Suspend dispatch
    pub suspend: bool,
    /// Comma-separated list of brokers in the cluster
    pub connected_brokers: String,
    /// Broker the client should move to
    pub reconnect_to: String,
    /// Whether the client should drop its current connection to rebalance
    pub rebalance_connection: bool,
}

/// Successful response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the command being answered
    pub correlation_id: u32,
}

/// Failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionResponse {
    /// Id of the command being answered
    pub correlation_id: u32,
    /// Broker error description
    pub message: String,
}
