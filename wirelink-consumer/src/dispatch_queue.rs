//! Per-consumer queue of dispatched messages.
//!
//! FIFO, shared between the connection's dispatch path (producer side) and any
//! number of receivers. Closing wakes every blocked receiver; a closed queue
//! hands out nothing.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::{sync::Notify, time::Instant};
use wirelink_core::command::MessageDispatch;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<MessageDispatch>,
    closed: bool,
}

/// Thread-safe FIFO of [`MessageDispatch`]es with deadline-bounded blocking pop.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl DispatchQueue {
    /// Create an empty, open queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a dispatch and wake one receiver. Ignored once closed.
    pub fn push(&self, dispatch: MessageDispatch) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.items.push_back(dispatch);
        }
        self.available.notify_one();
    }

    /// Take the head without waiting.
    #[must_use]
    pub fn pop(&self) -> Option<MessageDispatch> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.items.pop_front()
    }

    /// Take the head, waiting until `deadline` (forever if `None`).
    ///
    /// Returns `None` when the deadline passes or the queue is closed.
    pub async fn pop_until(&self, deadline: Option<Instant>) -> Option<MessageDispatch> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Registered before the check so a push in between is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(dispatch) = state.items.pop_front() {
                    return Some(dispatch);
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                },
                None => notified.await,
            }
        }
    }

    /// Remove and return everything queued.
    #[must_use]
    pub fn drain(&self) -> Vec<MessageDispatch> {
        self.state.lock().items.drain(..).collect()
    }

    /// Discard everything queued.
    pub fn clear(&self) {
        self.state.lock().items.clear();
    }

    /// Close the queue, discarding its contents and waking every receiver.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.clear();
        }
        self.available.notify_waiters();
    }

    /// Whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Number of queued dispatches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}
