//! Failover transport and its building blocks.

pub mod backup_pool;
pub mod failover_transport;
mod listener;
pub mod uri_pool;

pub use backup_pool::{BackupTransport, BackupTransportPool};
pub use failover_transport::{FailoverTransport, TransportState};
pub use uri_pool::UriPool;
