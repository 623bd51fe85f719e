//! Disposal queue for replaced transports.
//!
//! A transport that reported a failure may still be inside its own listener
//! callback, so it is never closed on that path. It is queued here instead and
//! closed by the task runner.

use super::composite_task_runner::CompositeTask;
use crate::transport::Transport;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tracing::{debug, warn};

/// Queue of transports waiting to be closed.
#[derive(Default)]
pub struct CloseTransportsTask {
    transports: Mutex<VecDeque<Arc<dyn Transport>>>,
}

impl CloseTransportsTask {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transport for closing. The owning runner must be woken afterwards.
    pub fn add(&self, transport: Arc<dyn Transport>) {
        self.transports.lock().push_back(transport);
    }

    /// Number of transports waiting to be closed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transports.lock().len()
    }

    /// Whether nothing is waiting to be closed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.lock().is_empty()
    }
}

#[async_trait]
impl CompositeTask for CloseTransportsTask {
    fn is_pending(&self) -> bool {
        !self.is_empty()
    }

    async fn iterate(&self) -> bool {
        let next = self.transports.lock().pop_front();
        if let Some(transport) = next {
            debug!("Closing replaced transport {:?}", transport.remote_address());
            if let Err(e) = transport.close().await {
                warn!("Error closing replaced transport: {e}");
            }
        }
        !self.is_empty()
    }
}

impl std::fmt::Debug for CloseTransportsTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseTransportsTask").field("queued", &self.len()).finish()
    }
}
