//! # Wirelink Consumer
//!
//! Client-side delivery engine for broker subscriptions.
//!
//! This crate provides:
//! - Per-consumer dispatch queues fed by the connection
//! - Blocking, bounded and non-blocking receive, plus an async message stream
//! - Asynchronous delivery through a [`MessageListener`]
//! - Acknowledgement in every session acknowledgement mode
//! - Pull requests for zero-prefetch consumers
//! - Silent discard (with acknowledgement) of expired messages
//!
//! ## Examples
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use std::sync::Arc;
//! use wirelink_consumer::MessageConsumer;
//!
//! # async fn example(consumer: Arc<MessageConsumer>) -> wirelink_core::Result<()> {
//! let mut messages = Box::pin(consumer.messages());
//! while let Some(message) = messages.next().await {
//!     println!("Received: {:?}", message.text());
//! }
//! consumer.close().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod consumer;
pub mod dispatch_queue;

pub use config::{ConsumerConfig, DEFAULT_PREFETCH_SIZE, MAX_PREFETCH_SIZE};
pub use consumer::{ConsumerSession, MessageConsumer, MessageListener};
pub use dispatch_queue::DispatchQueue;
pub use wirelink_core::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{ConsumerConfig, ConsumerSession, MessageConsumer, MessageListener};
    pub use wirelink_core::prelude::*;
}
