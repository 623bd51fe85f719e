//! Message producers.

use crate::session::Session;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use tracing::{debug, trace};
use wirelink_core::{
    command::{ObjectId, RemoveInfo},
    types::ProducerId,
    Command, CommandKind, Destination, Error, Message, MessageId, Result,
};

/// Sends messages on behalf of a [`Session`].
#[derive(Debug)]
pub struct MessageProducer {
    producer_id: ProducerId,
    destination: Option<Destination>,
    session: Weak<Session>,
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl MessageProducer {
    pub(crate) fn new(producer_id: ProducerId, destination: Option<Destination>, session: &Arc<Session>) -> Arc<Self> {
        Arc::new(Self {
            producer_id,
            destination,
            session: Arc::downgrade(session),
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Producer id.
    #[must_use]
    pub const fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    /// Destination every message goes to, if the producer is bound to one.
    #[must_use]
    pub const fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    /// Whether the producer has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a message and return the id assigned to it.
    ///
    /// A bound producer overrides the message's destination. Inside a
    /// transaction the message joins the session's transaction. Persistent
    /// messages outside a transaction wait for the broker's receipt; everything
    /// else is sent one-way.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] once closed, or the send failure.
    pub async fn send(&self, message: Message) -> Result<MessageId> {
        if self.is_closed() {
            return Err(Error::illegal_state(format!("producer {} is closed", self.producer_id)));
        }
        let session = self.session.upgrade().ok_or_else(|| Error::illegal_state("session is gone"))?;
        let connection = session.connection()?;

        let mut message = message;
        if let Some(destination) = &self.destination {
            message.destination = destination.clone();
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let message_id = MessageId::new(self.producer_id.clone(), sequence);
        message.message_id = Some(message_id.clone());
        message.transaction_id = session.transaction_id();

        let synchronous = message.persistent && message.transaction_id.is_none();
        trace!("Producer {} sending {message_id} to {}", self.producer_id, message.destination);
        let command = Command::new(CommandKind::Message(Box::new(message)));
        if synchronous {
            connection.request(command).await?;
        } else {
            connection.send(command).await?;
        }
        Ok(message_id)
    }

    /// Remove the producer on the broker. Idempotent.
    ///
    /// # Errors
    /// Returns the failure to send the removal.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        session.deregister_producer(&self.producer_id);
        debug!("Closing producer {}", self.producer_id);

        let remove = RemoveInfo { object_id: ObjectId::Producer(self.producer_id.clone()) };
        session.connection()?.send(Command::new(CommandKind::RemoveInfo(remove))).await
    }
}
