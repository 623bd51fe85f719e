//! Broker-side state tracking for replay after failover.

pub mod tracker;

pub use tracker::{ConnectionStateTracker, StateKey};
