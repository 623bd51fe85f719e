//! Response correlation.
//!
//! Requests are registered under their command id before they are sent; the
//! matching `Response` or `ExceptionResponse` completes the waiting caller. The
//! table keeps the request itself so that a failover transport can reissue
//! unanswered requests on a new connection.

use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::trace;
use wirelink_core::{Command, CommandKind, Error, Result};

/// First id handed out for requests sent without one. Chosen well above the ids a
/// connection assigns so that both can share a transport.
const GENERATED_ID_BASE: u32 = 0x4000_0000;

struct PendingRequest {
    command: Command,
    replayed_by_tracker: bool,
    reply: oneshot::Sender<Result<Command>>,
}

/// Table of in-flight requests keyed by command id.
pub struct RequestTable {
    next_id: AtomicU32,
    pending: Mutex<BTreeMap<u32, PendingRequest>>,
}

impl RequestTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self { next_id: AtomicU32::new(GENERATED_ID_BASE), pending: Mutex::new(BTreeMap::new()) }
    }

    /// Assign an id to a command sent with id `0` and mark it response-required.
    pub fn prepare(&self, command: &mut Command) {
        if command.command_id == 0 {
            command.command_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        }
        command.response_required = true;
    }

    /// Register a request; the receiver resolves with the response.
    ///
    /// `replayed_by_tracker` marks requests whose command is recreated by state
    /// replay, so [`RequestTable::reissuable`] does not send them twice.
    pub fn register(&self, command: &Command, replayed_by_tracker: bool) -> oneshot::Receiver<Result<Command>> {
        let (reply, receiver) = oneshot::channel();
        let request = PendingRequest { command: command.clone(), replayed_by_tracker, reply };
        self.pending.lock().insert(command.command_id, request);
        receiver
    }

    /// Mark a registered request as recreated by state replay.
    pub fn set_replayed_by_tracker(&self, command_id: u32, replayed: bool) {
        if let Some(request) = self.pending.lock().get_mut(&command_id) {
            request.replayed_by_tracker = replayed;
        }
    }

    /// Complete the request a response answers. Returns false when the response
    /// matches no pending request.
    pub fn complete(&self, response: &Command) -> bool {
        let Some(correlation_id) = response.correlation_id() else {
            return false;
        };
        let Some(request) = self.pending.lock().remove(&correlation_id) else {
            trace!("No pending request for correlation id {correlation_id}");
            return false;
        };

        let result = match &response.kind {
            CommandKind::ExceptionResponse(exception) => {
                Err(Error::Broker { message: exception.message.clone() })
            },
            _ => Ok(response.clone()),
        };
        // The caller may have given up waiting.
        let _ = request.reply.send(result);
        true
    }

    /// Forget a request whose caller stopped waiting.
    pub fn cancel(&self, command_id: u32) {
        self.pending.lock().remove(&command_id);
    }

    /// Fail every pending request with the given error.
    pub fn fail_all(&self, error: &Error) {
        let drained = std::mem::take(&mut *self.pending.lock());
        for request in drained.into_values() {
            let _ = request.reply.send(Err(error.clone()));
        }
    }

    /// Unanswered requests to resend on a new connection, in id order.
    #[must_use]
    pub fn reissuable(&self) -> Vec<Command> {
        self.pending
            .lock()
            .values()
            .filter(|request| !request.replayed_by_tracker)
            .map(|request| request.command.clone())
            .collect()
    }

    /// Number of pending requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether no request is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Wait for a registered request to complete.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] (after cancelling the request) when `timeout`
    /// elapses, the failure the request was completed with, or
    /// [`Error::TransportClosed`] if the table was dropped.
    pub async fn wait(
        &self,
        command_id: u32,
        receiver: oneshot::Receiver<Result<Command>>,
        timeout: Option<Duration>,
    ) -> Result<Command> {
        let outcome = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, receiver).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.cancel(command_id);
                    return Err(Error::timeout(format!("request {command_id}"), timeout));
                },
            },
            None => receiver.await,
        };

        outcome.unwrap_or_else(|_| Err(Error::closed("request abandoned")))
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTable").field("pending", &self.len()).finish()
    }
}
