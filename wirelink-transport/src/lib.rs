//! # Wirelink Transport
//!
//! Command transports for the wirelink broker client.
//!
//! - [`transport`]: the [`Transport`] contract and the scheme-selected [`TransportFactory`]
//! - [`tcp`]: framed commands over a TCP socket
//! - [`mock`]: in-memory transports on a simulated [`MockNetwork`]
//! - [`failover`]: the reconnecting [`FailoverTransport`]
//! - [`state`]: recording of broker-side state for replay
//! - [`correlator`]: request/response correlation
//! - [`threads`]: the background task runner
//!
//! ```rust,no_run
//! use wirelink_transport::{FailoverTransport, Transport, TransportFactory};
//!
//! # async fn demo() -> wirelink_core::Result<()> {
//! let transport = FailoverTransport::from_uri(
//!     "failover:(tcp://broker-a:61616,tcp://broker-b:61616)?randomize=false",
//!     TransportFactory::new(),
//! )?;
//! transport.start().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod correlator;
pub mod failover;
pub mod mock;
pub mod state;
pub mod tcp;
pub mod threads;
pub mod transport;

pub use correlator::RequestTable;
pub use failover::{BackupTransport, BackupTransportPool, FailoverTransport, TransportState, UriPool};
pub use mock::{MockNetwork, MockTransport};
pub use state::{ConnectionStateTracker, StateKey};
pub use tcp::TcpTransport;
pub use threads::{CloseTransportsTask, CompositeTask, CompositeTaskRunner};
pub use transport::{Transport, TransportFactory, TransportKind, TransportListener};
