//! # Message Consumer
//!
//! Delivery end of a subscription. The connection hands every
//! [`MessageDispatch`] for this consumer to [`MessageConsumer::dispatch`]; the
//! consumer either passes it straight to the registered [`MessageListener`] or
//! queues it for [`MessageConsumer::receive`].
//!
//! Expired messages are acknowledged as consumed and dropped wherever they are
//! found, so they never reach the application. Acknowledgements follow the
//! session's [`AcknowledgeMode`]:
//!
//! | Mode | Acknowledged |
//! |---|---|
//! | auto, dups-ok | as each message is consumed |
//! | client | cumulatively by [`MessageConsumer::acknowledge_message`] |
//! | individual | one message per [`MessageConsumer::acknowledge_message`] |
//! | transacted | as each message is consumed, inside the session transaction |

use crate::dispatch_queue::DispatchQueue;
use async_trait::async_trait;
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use wirelink_core::{
    command::{AckType, ConsumerInfo, MessageAck, MessageDispatch, MessagePull},
    types::{AcknowledgeMode, TransactionId},
    Command, CommandKind, ConsumerId, Destination, Error, Message, MessageId, Result,
};

/// Pull timeout asking the broker to wait until a message is available.
const PULL_WAIT: i64 = 0;

/// Pull timeout asking the broker to answer immediately.
const PULL_NO_WAIT: i64 = -1;

/// What a consumer needs from the session that created it.
#[async_trait]
pub trait ConsumerSession: Send + Sync {
    /// Send a command to the broker without waiting for a response.
    async fn oneway(&self, command: Command) -> Result<()>;

    /// Acknowledgement mode of the session.
    fn acknowledge_mode(&self) -> AcknowledgeMode;

    /// The session's open transaction, if any.
    fn transaction_id(&self) -> Option<TransactionId>;

    /// Deregister a closing consumer and remove it on the broker.
    async fn remove_consumer(&self, consumer_id: &ConsumerId) -> Result<()>;
}

/// Asynchronous message delivery callback.
///
/// Called on the dispatch path in broker order, with no synchronous consumer
/// lock held.
pub trait MessageListener: Send + Sync {
    /// Handle one message.
    fn on_message(&self, message: Message);
}

impl<F> MessageListener for F
where
    F: Fn(Message) + Send + Sync,
{
    fn on_message(&self, message: Message) {
        self(message);
    }
}

/// A subscription's delivery queue, listener and acknowledgement state.
pub struct MessageConsumer {
    info: ConsumerInfo,
    session: Weak<dyn ConsumerSession>,
    queue: DispatchQueue,
    listener: RwLock<Option<Arc<dyn MessageListener>>>,
    /// Serializes broker dispatch against listener installation and redispatch
    dispatch_lock: tokio::sync::Mutex<()>,
    /// Ids of delivered, not yet acknowledged messages (client and individual modes)
    delivered: Mutex<Vec<MessageId>>,
    closed: AtomicBool,
    close_error: Mutex<Option<Error>>,
}

impl MessageConsumer {
    /// Create a consumer for a subscription. The session is referenced, not owned.
    #[must_use]
    pub fn new(info: ConsumerInfo, session: &Arc<dyn ConsumerSession>) -> Arc<Self> {
        debug!("Creating consumer {} on {}", info.consumer_id, info.destination);
        Arc::new(Self {
            info,
            session: Arc::downgrade(session),
            queue: DispatchQueue::new(),
            listener: RwLock::new(None),
            dispatch_lock: tokio::sync::Mutex::new(()),
            delivered: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_error: Mutex::new(None),
        })
    }

    /// Consumer id.
    #[must_use]
    pub const fn consumer_id(&self) -> &ConsumerId {
        &self.info.consumer_id
    }

    /// Subscribed destination.
    #[must_use]
    pub const fn destination(&self) -> &Destination {
        &self.info.destination
    }

    /// The subscription as sent to the broker.
    #[must_use]
    pub const fn info(&self) -> &ConsumerInfo {
        &self.info
    }

    /// Whether the consumer has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// First error met while closing, if any.
    #[must_use]
    pub fn close_error(&self) -> Option<Error> {
        self.close_error.lock().clone()
    }

    /// Messages waiting in the dispatch queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn session(&self) -> Result<Arc<dyn ConsumerSession>> {
        self.session.upgrade().ok_or_else(|| Error::illegal_state("session is gone"))
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConsumerClosed);
        }
        Ok(())
    }

    /// Accept a message from the broker.
    ///
    /// Deliveries keep broker order, including across a listener swap that is
    /// still redispatching queued messages.
    ///
    /// # Errors
    /// Returns the failure to send an acknowledgement due on this delivery.
    pub async fn dispatch(&self, dispatch: MessageDispatch) -> Result<()> {
        let _ordered = self.dispatch_lock.lock().await;
        if self.is_closed() {
            trace!("Consumer {} closed; dropping dispatch", self.info.consumer_id);
            return Ok(());
        }
        if dispatch.message.is_expired() {
            return self.discard_expired(&dispatch).await;
        }

        let listener = self.listener.read().clone();
        match listener {
            Some(listener) => self.deliver(listener.as_ref(), &dispatch).await,
            None => {
                self.queue.push(dispatch);
                Ok(())
            },
        }
    }

    async fn deliver(&self, listener: &dyn MessageListener, dispatch: &MessageDispatch) -> Result<()> {
        let message = self.before_consume(dispatch);
        listener.on_message(message);
        self.after_consume(dispatch).await
    }

    async fn discard_expired(&self, dispatch: &MessageDispatch) -> Result<()> {
        debug!("Discarding expired message {:?}", dispatch.message.message_id);
        self.send_ack(dispatch, AckType::Consumed, false).await
    }

    /// Install or remove the asynchronous listener. Messages already queued are
    /// handed to the new listener in order.
    ///
    /// # Errors
    /// Returns [`Error::ConsumerClosed`] after close, or the failure to send an
    /// acknowledgement for a redispatched message.
    pub async fn set_message_listener(&self, listener: Option<Arc<dyn MessageListener>>) -> Result<()> {
        self.check_open()?;
        let _ordered = self.dispatch_lock.lock().await;
        *self.listener.write() = listener.clone();

        let Some(listener) = listener else {
            return Ok(());
        };
        let pending = self.queue.drain();
        if !pending.is_empty() {
            debug!("Redispatching {} queued messages to the new listener", pending.len());
        }
        for dispatch in pending {
            if dispatch.message.is_expired() {
                self.discard_expired(&dispatch).await?;
            } else {
                self.deliver(listener.as_ref(), &dispatch).await?;
            }
        }
        Ok(())
    }

    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` if the consumer is closed while waiting.
    ///
    /// # Errors
    /// Returns [`Error::ConsumerClosed`] if already closed and
    /// [`Error::IllegalState`] while a listener is installed.
    pub async fn receive(&self) -> Result<Option<Message>> {
        self.receive_until(None, PULL_WAIT).await
    }

    /// Wait up to `timeout` for the next message. A zero timeout waits
    /// indefinitely, like [`Self::receive`], and so does one too large to
    /// express as a deadline.
    ///
    /// # Errors
    /// As for [`Self::receive`].
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        if timeout.is_zero() {
            return self.receive().await;
        }
        let pull_timeout = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        // Past the clock's range the wait is unbounded.
        self.receive_until(Instant::now().checked_add(timeout), pull_timeout).await
    }

    /// Take a message that is already available, without waiting.
    ///
    /// # Errors
    /// As for [`Self::receive`].
    pub async fn receive_no_wait(&self) -> Result<Option<Message>> {
        self.check_receivable()?;
        self.pull_if_idle(PULL_NO_WAIT).await?;
        while let Some(dispatch) = self.queue.pop() {
            if dispatch.message.is_expired() {
                self.discard_expired(&dispatch).await?;
                continue;
            }
            return self.consume(&dispatch).await.map(Some);
        }
        Ok(None)
    }

    fn check_receivable(&self) -> Result<()> {
        self.check_open()?;
        if self.listener.read().is_some() {
            return Err(Error::illegal_state("cannot receive synchronously while a message listener is set"));
        }
        Ok(())
    }

    async fn receive_until(&self, deadline: Option<Instant>, pull_timeout: i64) -> Result<Option<Message>> {
        self.check_receivable()?;
        self.pull_if_idle(pull_timeout).await?;

        while let Some(dispatch) = self.queue.pop_until(deadline).await {
            if dispatch.message.is_expired() {
                self.discard_expired(&dispatch).await?;
                continue;
            }
            return self.consume(&dispatch).await.map(Some);
        }
        Ok(None)
    }

    /// Ask the broker for a message when prefetch is zero and nothing is queued.
    async fn pull_if_idle(&self, timeout: i64) -> Result<()> {
        if self.info.prefetch_size != 0 || !self.queue.is_empty() {
            return Ok(());
        }
        let pull = MessagePull {
            consumer_id: self.info.consumer_id.clone(),
            destination: self.info.destination.clone(),
            timeout,
        };
        trace!("Pulling for consumer {} (timeout {timeout})", self.info.consumer_id);
        self.session()?.oneway(Command::new(CommandKind::MessagePull(pull))).await
    }

    async fn consume(&self, dispatch: &MessageDispatch) -> Result<Message> {
        let message = self.before_consume(dispatch);
        self.after_consume(dispatch).await?;
        Ok(message)
    }

    /// Record the delivery and produce the application's own copy of the message.
    fn before_consume(&self, dispatch: &MessageDispatch) -> Message {
        let mut message = (*dispatch.message).clone();
        message.redelivery_counter = dispatch.redelivery_counter;

        let awaits_application_ack = matches!(
            self.acknowledge_mode(),
            Some(AcknowledgeMode::ClientAcknowledge | AcknowledgeMode::IndividualAcknowledge)
        );
        if awaits_application_ack {
            if let Some(id) = &message.message_id {
                self.delivered.lock().push(id.clone());
            }
        }
        message
    }

    async fn after_consume(&self, dispatch: &MessageDispatch) -> Result<()> {
        match self.acknowledge_mode() {
            Some(mode) if mode.acks_on_consume() => self.send_ack(dispatch, AckType::Consumed, false).await,
            Some(AcknowledgeMode::Transacted) => self.send_ack(dispatch, AckType::Consumed, true).await,
            _ => Ok(()),
        }
    }

    fn acknowledge_mode(&self) -> Option<AcknowledgeMode> {
        self.session.upgrade().map(|session| session.acknowledge_mode())
    }

    /// Acknowledge one dispatched message.
    ///
    /// The acknowledgement covers exactly that message and is scoped to the
    /// session transaction when the session is transacted.
    ///
    /// # Errors
    /// Returns [`Error::ConsumerClosed`] after close, [`Error::IllegalState`]
    /// for a transacted session without an open transaction or a message
    /// without an id, and any send failure.
    pub async fn acknowledge(&self, dispatch: &MessageDispatch, ack_type: AckType) -> Result<()> {
        self.check_open()?;
        let transacted = self.acknowledge_mode() == Some(AcknowledgeMode::Transacted);
        self.send_ack(dispatch, ack_type, transacted).await
    }

    /// Application acknowledgement of a received message.
    ///
    /// In client mode every message delivered up to and including `message` is
    /// acknowledged; in individual mode only `message`. Other modes acknowledge
    /// on their own and this call does nothing.
    ///
    /// # Errors
    /// Returns [`Error::ConsumerClosed`] after close, [`Error::IllegalState`] if
    /// `message` was not delivered by this consumer or is already acknowledged,
    /// and any send failure.
    pub async fn acknowledge_message(&self, message: &Message) -> Result<()> {
        self.check_open()?;
        let mode = self.acknowledge_mode();
        if !matches!(mode, Some(AcknowledgeMode::ClientAcknowledge | AcknowledgeMode::IndividualAcknowledge)) {
            return Ok(());
        }
        let id = message.message_id.clone().ok_or_else(|| Error::illegal_state("message has no id"))?;

        let (first, count, ack_type) = {
            let mut delivered = self.delivered.lock();
            let position = delivered
                .iter()
                .position(|delivered_id| delivered_id == &id)
                .ok_or_else(|| Error::illegal_state(format!("message {id} is not awaiting acknowledgement")))?;
            if mode == Some(AcknowledgeMode::IndividualAcknowledge) {
                delivered.remove(position);
                (id.clone(), 1, AckType::Individual)
            } else {
                let acked: Vec<MessageId> = delivered.drain(..=position).collect();
                let first = acked.first().cloned().unwrap_or_else(|| id.clone());
                (first, acked.len(), AckType::Consumed)
            }
        };

        let ack = MessageAck {
            ack_type,
            consumer_id: self.info.consumer_id.clone(),
            destination: self.info.destination.clone(),
            first_message_id: first,
            last_message_id: id,
            message_count: u32::try_from(count).unwrap_or(u32::MAX),
            transaction_id: None,
        };
        self.session()?.oneway(Command::new(CommandKind::MessageAck(ack))).await
    }

    async fn send_ack(&self, dispatch: &MessageDispatch, ack_type: AckType, require_transaction: bool) -> Result<()> {
        let session = self.session()?;
        let id = dispatch.message.message_id.clone().ok_or_else(|| Error::illegal_state("message has no id"))?;

        let transaction_id = session.transaction_id();
        if require_transaction && transaction_id.is_none() {
            return Err(Error::illegal_state("transacted session has no open transaction"));
        }

        let ack = MessageAck {
            ack_type,
            consumer_id: self.info.consumer_id.clone(),
            destination: self.info.destination.clone(),
            first_message_id: id.clone(),
            last_message_id: id,
            message_count: 1,
            transaction_id,
        };
        session.oneway(Command::new(CommandKind::MessageAck(ack))).await
    }

    /// Discard queued and unacknowledged messages, e.g. after a connection
    /// interruption; the broker redelivers them.
    pub fn clear_message_queue(&self) {
        let dropped = self.queue.len();
        self.queue.clear();
        self.delivered.lock().clear();
        if dropped > 0 {
            debug!("Cleared {dropped} queued messages from consumer {}", self.info.consumer_id);
        }
    }

    /// Close the consumer.
    ///
    /// Deregisters from the session, purges the queue and wakes every blocked
    /// receiver with `None`. Every step runs even if an earlier one fails; the
    /// first failure is recorded and returned. Closing again does nothing.
    ///
    /// # Errors
    /// Returns the first failure met while closing.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut first_error = None;
        match self.session.upgrade() {
            Some(session) => {
                if let Err(e) = session.remove_consumer(&self.info.consumer_id).await {
                    warn!("Failed to deregister consumer {}: {e}", self.info.consumer_id);
                    first_error.get_or_insert(e);
                }
            },
            None => debug!("Session already gone while closing consumer {}", self.info.consumer_id),
        }

        let purged = self.queue.len();
        self.queue.close();
        self.delivered.lock().clear();
        *self.listener.write() = None;
        info!("Consumer {} closed ({purged} queued messages purged)", self.info.consumer_id);

        match first_error {
            Some(e) => {
                *self.close_error.lock() = Some(e.clone());
                Err(e)
            },
            None => Ok(()),
        }
    }

    /// Received messages as a stream, ending when the consumer closes or a
    /// receive fails.
    pub fn messages(self: &Arc<Self>) -> impl Stream<Item = Message> + Send {
        futures::stream::unfold(Arc::clone(self), |consumer| async move {
            match consumer.receive().await {
                Ok(Some(message)) => Some((message, consumer)),
                Ok(None) => None,
                Err(e) => {
                    debug!("Message stream ended: {e}");
                    None
                },
            }
        })
    }
}

impl fmt::Debug for MessageConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("consumer_id", &self.info.consumer_id)
            .field("destination", &self.info.destination)
            .field("queued", &self.queue.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirelink_core::{
        types::{ProducerId, SessionId},
        ConnectionId,
    };

    #[derive(Default)]
    struct StubSession {
        sent: Mutex<Vec<Command>>,
    }

    #[async_trait]
    impl ConsumerSession for StubSession {
        async fn oneway(&self, command: Command) -> Result<()> {
            self.sent.lock().push(command);
            Ok(())
        }

        fn acknowledge_mode(&self) -> AcknowledgeMode {
            AcknowledgeMode::AutoAcknowledge
        }

        fn transaction_id(&self) -> Option<TransactionId> {
            None
        }

        async fn remove_consumer(&self, _consumer_id: &ConsumerId) -> Result<()> {
            Ok(())
        }
    }

    fn consumer(session: &Arc<StubSession>, prefetch: u32) -> Arc<MessageConsumer> {
        let session_id = SessionId::new(ConnectionId::new("c"), 1);
        let info = ConsumerInfo::new(ConsumerId::new(session_id, 1), Destination::queue("q"), prefetch);
        let session: Arc<dyn ConsumerSession> = session.clone();
        MessageConsumer::new(info, &session)
    }

    fn dispatch(consumer: &MessageConsumer, sequence: u64) -> MessageDispatch {
        let producer = ProducerId::new(SessionId::new(ConnectionId::new("p"), 1), 1);
        let mut message = Message::new(Destination::queue("q"), format!("m{sequence}"));
        message.message_id = Some(MessageId::new(producer, sequence));
        MessageDispatch {
            consumer_id: consumer.consumer_id().clone(),
            destination: Destination::queue("q"),
            message: Box::new(message),
            redelivery_counter: 2,
        }
    }

    #[tokio::test]
    async fn test_received_message_carries_redelivery_counter() {
        let session = Arc::new(StubSession::default());
        let consumer = consumer(&session, 10);
        consumer.dispatch(dispatch(&consumer, 1)).await.unwrap();

        let message = consumer.receive_no_wait().await.unwrap().unwrap();
        assert_eq!(message.redelivery_counter, 2);
        assert_eq!(session.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_consumer_fails_fast() {
        let session = Arc::new(StubSession::default());
        let consumer = consumer(&session, 10);
        consumer.close().await.unwrap();
        consumer.close().await.unwrap();

        assert!(matches!(consumer.receive().await, Err(Error::ConsumerClosed)));
        assert!(matches!(consumer.receive_no_wait().await, Err(Error::ConsumerClosed)));
        assert!(consumer.set_message_listener(None).await.is_err());
    }

    #[tokio::test]
    async fn test_receive_rejected_while_listener_set() {
        let session = Arc::new(StubSession::default());
        let consumer = consumer(&session, 10);
        let listener: Arc<dyn MessageListener> = Arc::new(|_message: Message| {});
        consumer.set_message_listener(Some(listener)).await.unwrap();

        assert!(matches!(consumer.receive_no_wait().await, Err(Error::IllegalState { .. })));
    }

    #[tokio::test]
    async fn test_dispatch_after_close_is_dropped() {
        let session = Arc::new(StubSession::default());
        let consumer = consumer(&session, 10);
        consumer.close().await.unwrap();

        consumer.dispatch(dispatch(&consumer, 1)).await.unwrap();
        assert_eq!(consumer.queued(), 0);
        assert!(session.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_clear_message_queue() {
        let session = Arc::new(StubSession::default());
        let consumer = consumer(&session, 10);
        consumer.dispatch(dispatch(&consumer, 1)).await.unwrap();
        consumer.dispatch(dispatch(&consumer, 2)).await.unwrap();

        consumer.clear_message_queue();
        assert_eq!(consumer.queued(), 0);
        assert!(consumer.receive_no_wait().await.unwrap().is_none());
    }
}
