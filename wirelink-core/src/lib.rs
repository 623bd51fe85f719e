//! # Wirelink Core
//!
//! Shared foundation of the wirelink broker client: identifiers, messages, the
//! command model, the frame codec, configuration and logging setup.
//!
//! - [`types`]: connection-scoped identifiers and destinations
//! - [`message`]: application messages and expiry
//! - [`command`]: commands exchanged with the broker
//! - [`codec`]: framing of commands on a byte stream
//! - [`config`]: failover configuration, URI parsing and loading
//! - [`telemetry`]: `tracing` subscriber installation
//! - [`error`]: error type shared by every wirelink crate

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod message;
pub mod prelude;
pub mod telemetry;
pub mod types;

pub use command::{Command, CommandKind};
pub use error::{Error, Result};
pub use message::Message;
pub use types::{ConnectionId, ConsumerId, Destination, MessageId, SessionId};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
