//! Dispatch, receive and acknowledgement behaviour of [`MessageConsumer`].

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use wirelink_consumer::{ConsumerConfig, ConsumerSession, MessageConsumer, MessageListener};
use wirelink_core::{
    command::{AckType, MessageAck, MessageDispatch, MessagePull},
    types::{AcknowledgeMode, ProducerId, TransactionId},
    Command, CommandKind, ConnectionId, ConsumerId, Destination, Error, Message, MessageId, SessionId,
};

// ================================================================================================
// Fixtures
// ================================================================================================

struct RecordingSession {
    mode: AcknowledgeMode,
    transaction: Mutex<Option<TransactionId>>,
    sent: Mutex<Vec<Command>>,
    removed: Mutex<Vec<ConsumerId>>,
    fail_removal: bool,
    send_delay: Duration,
}

impl RecordingSession {
    fn new(mode: AcknowledgeMode) -> Arc<Self> {
        Self::build(mode, false, Duration::ZERO)
    }

    fn failing_removal(mode: AcknowledgeMode) -> Arc<Self> {
        Self::build(mode, true, Duration::ZERO)
    }

    /// Every send suspends the caller for `delay` before completing.
    fn slow_sends(mode: AcknowledgeMode, delay: Duration) -> Arc<Self> {
        Self::build(mode, false, delay)
    }

    fn build(mode: AcknowledgeMode, fail_removal: bool, send_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            mode,
            transaction: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            fail_removal,
            send_delay,
        })
    }

    fn acks(&self) -> Vec<MessageAck> {
        self.sent
            .lock()
            .iter()
            .filter_map(|command| match &command.kind {
                CommandKind::MessageAck(ack) => Some(ack.clone()),
                _ => None,
            })
            .collect()
    }

    fn pulls(&self) -> Vec<MessagePull> {
        self.sent
            .lock()
            .iter()
            .filter_map(|command| match &command.kind {
                CommandKind::MessagePull(pull) => Some(pull.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ConsumerSession for RecordingSession {
    async fn oneway(&self, command: Command) -> wirelink_core::Result<()> {
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        self.sent.lock().push(command);
        Ok(())
    }

    fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.mode
    }

    fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction.lock().clone()
    }

    async fn remove_consumer(&self, consumer_id: &ConsumerId) -> wirelink_core::Result<()> {
        self.removed.lock().push(consumer_id.clone());
        if self.fail_removal {
            return Err(Error::closed("connection lost"));
        }
        Ok(())
    }
}

fn consumer_with(session: &Arc<RecordingSession>, config: &ConsumerConfig) -> Arc<MessageConsumer> {
    let session_id = SessionId::new(ConnectionId::new("conn"), 1);
    let info = config.consumer_info(ConsumerId::new(session_id, 1), Destination::queue("orders"));
    let session: Arc<dyn ConsumerSession> = session.clone();
    MessageConsumer::new(info, &session)
}

fn consumer(session: &Arc<RecordingSession>) -> Arc<MessageConsumer> {
    consumer_with(session, &ConsumerConfig::default())
}

fn message_id(sequence: u64) -> MessageId {
    MessageId::new(ProducerId::new(SessionId::new(ConnectionId::new("producer"), 1), 1), sequence)
}

fn dispatch_message(consumer: &MessageConsumer, sequence: u64, message: Message) -> MessageDispatch {
    let mut message = message;
    message.message_id = Some(message_id(sequence));
    MessageDispatch {
        consumer_id: consumer.consumer_id().clone(),
        destination: consumer.destination().clone(),
        message: Box::new(message),
        redelivery_counter: 0,
    }
}

fn dispatch(consumer: &MessageConsumer, sequence: u64) -> MessageDispatch {
    dispatch_message(consumer, sequence, Message::new(Destination::queue("orders"), format!("m{sequence}")))
}

fn expired(consumer: &MessageConsumer, sequence: u64) -> MessageDispatch {
    let message = Message::new(Destination::queue("orders"), "stale").with_expiration(1);
    dispatch_message(consumer, sequence, message)
}

#[derive(Default)]
struct CollectingListener {
    received: Mutex<Vec<Message>>,
}

impl MessageListener for CollectingListener {
    fn on_message(&self, message: Message) {
        self.received.lock().push(message);
    }
}

impl CollectingListener {
    fn texts(&self) -> Vec<String> {
        self.received.lock().iter().filter_map(|m| m.text().map(str::to_string)).collect()
    }
}

// ================================================================================================
// Expiry
// ================================================================================================

#[tokio::test]
async fn test_expired_message_is_acked_once_and_never_delivered() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::AutoAcknowledge);
    let consumer = consumer(&session);
    let listener = Arc::new(CollectingListener::default());
    consumer.set_message_listener(Some(listener.clone())).await?;

    consumer.dispatch(expired(&consumer, 1)).await?;

    assert!(listener.received.lock().is_empty());
    assert_eq!(consumer.queued(), 0);
    let acks = session.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].ack_type, AckType::Consumed);
    assert_eq!(acks[0].last_message_id, message_id(1));
    assert_eq!(acks[0].message_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_message_expiring_in_queue_is_skipped() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::AutoAcknowledge);
    let consumer = consumer(&session);

    let short_lived = Message::new(Destination::queue("orders"), "short").with_time_to_live(Duration::from_millis(20));
    consumer.dispatch(dispatch_message(&consumer, 1, short_lived)).await?;
    consumer.dispatch(dispatch(&consumer, 2)).await?;
    tokio::time::sleep(Duration::from_millis(40)).await;

    let received = consumer.receive_timeout(Duration::from_millis(100)).await?.unwrap();
    assert_eq!(received.text(), Some("m2"));

    let acked: Vec<MessageId> = session.acks().into_iter().map(|ack| ack.last_message_id).collect();
    assert_eq!(acked, vec![message_id(1), message_id(2)]);
    Ok(())
}

// ================================================================================================
// Receive
// ================================================================================================

#[tokio::test]
async fn test_receive_timeout_is_bounded() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::AutoAcknowledge);
    let consumer = consumer(&session);

    let started = Instant::now();
    let received = consumer.receive_timeout(Duration::from_millis(50)).await?;
    let elapsed = started.elapsed();

    assert!(received.is_none());
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(1));
    Ok(())
}

#[tokio::test]
async fn test_receive_timeout_beyond_clock_range_waits_indefinitely() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::AutoAcknowledge);
    let consumer = consumer(&session);
    consumer.dispatch(dispatch(&consumer, 1)).await?;

    let received = consumer.receive_timeout(Duration::MAX).await?;
    assert_eq!(received.and_then(|m| m.message_id), Some(message_id(1)));

    let waiting = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.receive_timeout(Duration::MAX).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiting.is_finished());
    consumer.close().await?;
    assert!(waiting.await??.is_none());
    Ok(())
}

#[tokio::test]
async fn test_receive_timeout_returns_message_arriving_late() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::AutoAcknowledge);
    let consumer = consumer(&session);

    let delivery = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            consumer.dispatch(dispatch(&consumer, 1)).await
        })
    };

    let received = consumer.receive_timeout(Duration::from_secs(2)).await?;
    assert_eq!(received.and_then(|m| m.text().map(str::to_string)).as_deref(), Some("m1"));
    delivery.await??;
    Ok(())
}

#[tokio::test]
async fn test_close_releases_every_blocked_receiver() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::AutoAcknowledge);
    let consumer = consumer(&session);

    let receivers: Vec<_> = (0..3)
        .map(|_| {
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move { consumer.receive().await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    consumer.close().await?;
    for receiver in receivers {
        let outcome = tokio::time::timeout(Duration::from_secs(1), receiver).await??;
        assert!(outcome?.is_none());
    }
    Ok(())
}

#[tokio::test]
async fn test_closed_consumer_fails_fast() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::AutoAcknowledge);
    let consumer = consumer(&session);
    consumer.close().await?;

    assert!(matches!(consumer.receive().await, Err(Error::ConsumerClosed)));
    assert!(matches!(consumer.receive_timeout(Duration::from_millis(10)).await, Err(Error::ConsumerClosed)));
    assert!(matches!(consumer.receive_no_wait().await, Err(Error::ConsumerClosed)));
    assert_eq!(session.removed.lock().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_message_stream_ends_on_close() -> Result<()> {
    use futures::StreamExt;

    let session = RecordingSession::new(AcknowledgeMode::AutoAcknowledge);
    let consumer = consumer(&session);
    consumer.dispatch(dispatch(&consumer, 1)).await?;
    consumer.dispatch(dispatch(&consumer, 2)).await?;

    let collector = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.messages().collect::<Vec<_>>().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    consumer.close().await?;

    let messages = tokio::time::timeout(Duration::from_secs(1), collector).await??;
    let texts: Vec<_> = messages.iter().filter_map(Message::text).collect();
    assert_eq!(texts, vec!["m1", "m2"]);
    Ok(())
}

// ================================================================================================
// Pull
// ================================================================================================

#[tokio::test]
async fn test_zero_prefetch_pulls_with_receive_timeouts() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::AutoAcknowledge);
    let consumer = consumer_with(&session, &ConsumerConfig::pull());

    assert!(consumer.receive_no_wait().await?.is_none());
    assert!(consumer.receive_timeout(Duration::from_millis(30)).await?.is_none());

    let waiting = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    consumer.dispatch(dispatch(&consumer, 1)).await?;
    assert!(tokio::time::timeout(Duration::from_secs(1), waiting).await???.is_some());

    let timeouts: Vec<i64> = session.pulls().iter().map(|pull| pull.timeout).collect();
    assert_eq!(timeouts, vec![-1, 30, 0]);
    Ok(())
}

#[tokio::test]
async fn test_no_pull_while_messages_are_queued() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::AutoAcknowledge);
    let consumer = consumer_with(&session, &ConsumerConfig::pull());
    consumer.dispatch(dispatch(&consumer, 1)).await?;

    assert!(consumer.receive_no_wait().await?.is_some());
    assert!(session.pulls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_prefetching_consumer_never_pulls() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::AutoAcknowledge);
    let consumer = consumer(&session);

    assert!(consumer.receive_no_wait().await?.is_none());
    assert!(consumer.receive_timeout(Duration::from_millis(10)).await?.is_none());
    assert!(session.pulls().is_empty());
    Ok(())
}

// ================================================================================================
// Listener
// ================================================================================================

#[tokio::test]
async fn test_listener_receives_queued_messages_in_order() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::AutoAcknowledge);
    let consumer = consumer(&session);
    for sequence in 1..=3 {
        consumer.dispatch(dispatch(&consumer, sequence)).await?;
    }

    let listener = Arc::new(CollectingListener::default());
    consumer.set_message_listener(Some(listener.clone())).await?;
    consumer.dispatch(dispatch(&consumer, 4)).await?;

    assert_eq!(listener.texts(), vec!["m1", "m2", "m3", "m4"]);
    assert_eq!(consumer.queued(), 0);
    assert_eq!(session.acks().len(), 4);
    assert!(matches!(consumer.receive_no_wait().await, Err(Error::IllegalState { .. })));
    Ok(())
}

#[tokio::test]
async fn test_dispatch_during_redispatch_keeps_broker_order() -> Result<()> {
    let session = RecordingSession::slow_sends(AcknowledgeMode::AutoAcknowledge, Duration::from_millis(20));
    let consumer = consumer(&session);
    for sequence in 1..=2 {
        consumer.dispatch(dispatch(&consumer, sequence)).await?;
    }

    let listener = Arc::new(CollectingListener::default());
    let install = {
        let consumer = Arc::clone(&consumer);
        let listener: Arc<dyn MessageListener> = listener.clone();
        tokio::spawn(async move { consumer.set_message_listener(Some(listener)).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    consumer.dispatch(dispatch(&consumer, 3)).await?;
    install.await??;

    assert_eq!(listener.texts(), vec!["m1", "m2", "m3"]);
    assert_eq!(consumer.queued(), 0);
    assert_eq!(session.acks().len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_removing_listener_restores_queueing() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::AutoAcknowledge);
    let consumer = consumer(&session);
    let listener = Arc::new(CollectingListener::default());
    consumer.set_message_listener(Some(listener.clone())).await?;
    consumer.set_message_listener(None).await?;

    consumer.dispatch(dispatch(&consumer, 1)).await?;
    assert!(listener.received.lock().is_empty());
    assert_eq!(consumer.receive_no_wait().await?.and_then(|m| m.message_id), Some(message_id(1)));
    Ok(())
}

// ================================================================================================
// Acknowledgement
// ================================================================================================

#[tokio::test]
async fn test_transacted_ack_carries_transaction() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::Transacted);
    let transaction = TransactionId::new(ConnectionId::new("conn"), 7);
    *session.transaction.lock() = Some(transaction.clone());
    let consumer = consumer(&session);

    let delivered = dispatch(&consumer, 1);
    consumer.acknowledge(&delivered, AckType::Delivered).await?;
    consumer.dispatch(dispatch(&consumer, 2)).await?;
    consumer.receive_no_wait().await?;

    let acks = session.acks();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[0].ack_type, AckType::Delivered);
    assert!(acks.iter().all(|ack| ack.transaction_id.as_ref() == Some(&transaction)));
    assert!(acks.iter().all(|ack| ack.first_message_id == ack.last_message_id && ack.message_count == 1));
    Ok(())
}

#[tokio::test]
async fn test_transacted_ack_without_transaction_is_rejected() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::Transacted);
    let consumer = consumer(&session);

    let outcome = consumer.acknowledge(&dispatch(&consumer, 1), AckType::Consumed).await;
    assert!(matches!(outcome, Err(Error::IllegalState { .. })));
    assert!(session.acks().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_client_ack_covers_everything_delivered() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::ClientAcknowledge);
    let consumer = consumer(&session);
    for sequence in 1..=3 {
        consumer.dispatch(dispatch(&consumer, sequence)).await?;
    }

    let _first = consumer.receive_no_wait().await?.unwrap();
    let second = consumer.receive_no_wait().await?.unwrap();
    assert!(session.acks().is_empty());

    consumer.acknowledge_message(&second).await?;
    let acks = session.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].ack_type, AckType::Consumed);
    assert_eq!(acks[0].first_message_id, message_id(1));
    assert_eq!(acks[0].last_message_id, message_id(2));
    assert_eq!(acks[0].message_count, 2);

    assert!(matches!(consumer.acknowledge_message(&second).await, Err(Error::IllegalState { .. })));
    Ok(())
}

#[tokio::test]
async fn test_individual_ack_covers_one_message() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::IndividualAcknowledge);
    let consumer = consumer(&session);
    consumer.dispatch(dispatch(&consumer, 1)).await?;
    consumer.dispatch(dispatch(&consumer, 2)).await?;

    let _first = consumer.receive_no_wait().await?.unwrap();
    let second = consumer.receive_no_wait().await?.unwrap();
    consumer.acknowledge_message(&second).await?;

    let acks = session.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].ack_type, AckType::Individual);
    assert_eq!(acks[0].first_message_id, message_id(2));
    assert_eq!(acks[0].message_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_auto_ack_ignores_application_ack() -> Result<()> {
    let session = RecordingSession::new(AcknowledgeMode::AutoAcknowledge);
    let consumer = consumer(&session);
    consumer.dispatch(dispatch(&consumer, 1)).await?;

    let message = consumer.receive_no_wait().await?.unwrap();
    consumer.acknowledge_message(&message).await?;
    assert_eq!(session.acks().len(), 1);
    Ok(())
}

// ================================================================================================
// Close
// ================================================================================================

#[tokio::test]
async fn test_close_records_first_error_and_still_purges() -> Result<()> {
    let session = RecordingSession::failing_removal(AcknowledgeMode::AutoAcknowledge);
    let consumer = consumer(&session);
    consumer.dispatch(dispatch(&consumer, 1)).await?;

    let outcome = consumer.close().await;
    assert!(matches!(outcome, Err(Error::TransportClosed { .. })));
    assert!(matches!(consumer.close_error(), Some(Error::TransportClosed { .. })));
    assert!(consumer.is_closed());
    assert_eq!(consumer.queued(), 0);

    consumer.close().await?;
    assert_eq!(session.removed.lock().len(), 1);
    Ok(())
}
