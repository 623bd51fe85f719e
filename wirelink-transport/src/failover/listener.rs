//! Listener installed on each transport adopted by a [`FailoverTransport`].

use super::FailoverTransport;
use crate::transport::TransportListener;
use async_trait::async_trait;
use std::sync::Weak;
use wirelink_core::{Command, Error};

/// Routes traffic from one underlying transport back to its failover parent,
/// tagged with the id the parent assigned to that transport.
pub(crate) struct FailoverTransportListener {
    transport_id: u64,
    parent: Weak<FailoverTransport>,
}

impl FailoverTransportListener {
    pub(crate) const fn new(transport_id: u64, parent: Weak<FailoverTransport>) -> Self {
        Self { transport_id, parent }
    }
}

#[async_trait]
impl TransportListener for FailoverTransportListener {
    async fn on_command(&self, command: Command) {
        if let Some(parent) = self.parent.upgrade() {
            parent.handle_command(self.transport_id, command).await;
        }
    }

    async fn on_exception(&self, error: Error) {
        if let Some(parent) = self.parent.upgrade() {
            parent.handle_transport_failure(self.transport_id, error).await;
        }
    }
}
