//! # Wirelink Client
//!
//! Connection, session and producer API over the failover transport, with
//! consumers from `wirelink-consumer`.
//!
//! - [`Connection`]: one failover transport, id generation and dispatch routing
//! - [`Session`]: acknowledgement mode and transaction scope
//! - [`MessageProducer`]: message sending
//!
//! ## Examples
//!
//! ```rust,no_run
//! use wirelink_client::{ClientConfig, Connection};
//! use wirelink_core::{types::AcknowledgeMode, Destination, Message};
//! use wirelink_transport::TransportFactory;
//!
//! # async fn example() -> wirelink_core::Result<()> {
//! let config = ClientConfig::for_broker("failover:(tcp://broker-a:61616,tcp://broker-b:61616)");
//! let connection = Connection::create(config, TransportFactory::new())?;
//! let session = connection.create_session(AcknowledgeMode::AutoAcknowledge).await?;
//!
//! let orders = Destination::queue("orders");
//! let producer = session.create_producer(Some(orders.clone())).await?;
//! producer.send(Message::new(orders.clone(), "order #1")).await?;
//!
//! let consumer = session.create_consumer(orders).await?;
//! if let Some(message) = consumer.receive_timeout(std::time::Duration::from_secs(5)).await? {
//!     println!("Received: {:?}", message.text());
//! }
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod producer;
pub mod session;

pub use config::ClientConfig;
pub use connection::{Connection, ConnectionListener, ExceptionListener};
pub use producer::MessageProducer;
pub use session::Session;
pub use wirelink_consumer::{MessageConsumer, MessageListener};
pub use wirelink_core::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{ClientConfig, Connection, MessageConsumer, MessageListener, MessageProducer, Session};
    pub use wirelink_core::prelude::*;
}
