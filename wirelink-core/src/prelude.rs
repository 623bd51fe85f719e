//! # Prelude
//!
//! Commonly used types from the wirelink core library.

pub use crate::{
    command::{AckType, Command, CommandKind, ConsumerInfo, MessageAck, MessageDispatch},
    config::{FailoverConfig, FailoverUri, LoggingConfig},
    error::{Error, Result},
    message::Message,
    types::{AcknowledgeMode, ConnectionId, ConsumerId, Destination, IdGenerator, MessageId, SessionId},
};

pub use bytes::Bytes;
pub use url::Url;
