//! Sessions: the unit of acknowledgement and transaction scope.

use crate::{connection::Connection, producer::MessageProducer};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tracing::{debug, info};
use wirelink_consumer::{ConsumerConfig, ConsumerSession, MessageConsumer};
use wirelink_core::{
    command::{ObjectId, ProducerInfo, RemoveInfo, TransactionInfo, TransactionType},
    types::{AcknowledgeMode, ProducerId, TransactionId},
    Command, CommandKind, ConsumerId, Destination, Error, Result, SessionId,
};

/// A session on a [`Connection`].
///
/// A transacted session always has an open transaction: one is begun when the
/// session is created and again after every commit or rollback.
pub struct Session {
    session_id: SessionId,
    mode: AcknowledgeMode,
    connection: Weak<Connection>,
    transaction: Mutex<Option<TransactionId>>,
    consumers: DashMap<ConsumerId, Arc<MessageConsumer>>,
    producers: DashMap<ProducerId, Arc<MessageProducer>>,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(session_id: SessionId, mode: AcknowledgeMode, connection: &Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            mode,
            connection: Arc::downgrade(connection),
            transaction: Mutex::new(None),
            consumers: DashMap::new(),
            producers: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Session id.
    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Acknowledgement mode.
    #[must_use]
    pub const fn mode(&self) -> AcknowledgeMode {
        self.mode
    }

    /// The open transaction, if any.
    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction.lock().clone()
    }

    /// Whether the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn connection(&self) -> Result<Arc<Connection>> {
        self.connection.upgrade().ok_or_else(|| Error::closed("connection is gone"))
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::illegal_state(format!("session {} is closed", self.session_id)));
        }
        Ok(())
    }

    fn check_transacted(&self) -> Result<()> {
        if self.mode != AcknowledgeMode::Transacted {
            return Err(Error::illegal_state(format!("session {} is not transacted", self.session_id)));
        }
        Ok(())
    }

    /// Subscribe to a destination with the connection's consumer defaults.
    ///
    /// # Errors
    /// Returns an error if the session is closed or the broker refuses the subscription.
    pub async fn create_consumer(self: &Arc<Self>, destination: Destination) -> Result<Arc<MessageConsumer>> {
        let config = self.connection()?.default_consumer_config().clone();
        self.create_consumer_with(destination, &config).await
    }

    /// Subscribe to a destination with explicit options.
    ///
    /// The consumer is routable before the subscription reaches the broker, so
    /// no early dispatch is lost.
    ///
    /// # Errors
    /// Returns an error if the session is closed or the broker refuses the subscription.
    pub async fn create_consumer_with(
        self: &Arc<Self>,
        destination: Destination,
        config: &ConsumerConfig,
    ) -> Result<Arc<MessageConsumer>> {
        self.check_open()?;
        let connection = self.connection()?;

        let consumer_id = connection.ids().next_consumer_id(&self.session_id);
        let info = config.consumer_info(consumer_id.clone(), destination);
        let session: Arc<dyn ConsumerSession> = Arc::clone(self) as Arc<dyn ConsumerSession>;
        let consumer = MessageConsumer::new(info.clone(), &session);

        self.consumers.insert(consumer_id.clone(), Arc::clone(&consumer));
        connection.register_consumer(&consumer);

        if let Err(e) = connection.request(Command::new(CommandKind::ConsumerInfo(info))).await {
            self.consumers.remove(&consumer_id);
            connection.deregister_consumer(&consumer_id);
            return Err(e);
        }
        debug!("Created consumer {consumer_id} on {}", consumer.destination());
        Ok(consumer)
    }

    /// Register a producer, optionally bound to one destination.
    ///
    /// # Errors
    /// Returns an error if the session is closed or the broker refuses the producer.
    pub async fn create_producer(self: &Arc<Self>, destination: Option<Destination>) -> Result<Arc<MessageProducer>> {
        self.check_open()?;
        let connection = self.connection()?;

        let producer_id = connection.ids().next_producer_id(&self.session_id);
        let info = ProducerInfo { producer_id: producer_id.clone(), destination: destination.clone() };
        connection.request(Command::new(CommandKind::ProducerInfo(info))).await?;

        let producer = MessageProducer::new(producer_id.clone(), destination, self);
        self.producers.insert(producer_id, Arc::clone(&producer));
        Ok(producer)
    }

    /// Open a transaction. Does nothing if one is already open.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] for a non-transacted or closed session.
    pub async fn begin(&self) -> Result<()> {
        self.check_open()?;
        self.check_transacted()?;
        if self.transaction.lock().is_some() {
            return Ok(());
        }

        let connection = self.connection()?;
        let transaction_id = connection.ids().next_transaction_id();
        self.send_transaction(&connection, &transaction_id, TransactionType::Begin).await?;
        debug!("Session {} began transaction {transaction_id}", self.session_id);
        *self.transaction.lock() = Some(transaction_id);
        Ok(())
    }

    /// Commit the open transaction and begin the next one.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] for a non-transacted or closed session, or
    /// the broker's refusal of the commit.
    pub async fn commit(&self) -> Result<()> {
        self.complete(TransactionType::CommitOnePhase).await
    }

    /// Roll back the open transaction and begin the next one.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] for a non-transacted or closed session, or
    /// the broker's refusal of the rollback.
    pub async fn rollback(&self) -> Result<()> {
        self.complete(TransactionType::Rollback).await
    }

    async fn complete(&self, kind: TransactionType) -> Result<()> {
        self.check_open()?;
        self.check_transacted()?;
        let connection = self.connection()?;

        let transaction_id = self.transaction.lock().take();
        if let Some(transaction_id) = transaction_id {
            let outcome = connection
                .request(Command::new(CommandKind::TransactionInfo(TransactionInfo {
                    connection_id: connection.connection_id().clone(),
                    transaction_id: transaction_id.clone(),
                    kind,
                })))
                .await;
            if let Err(e) = outcome {
                *self.transaction.lock() = Some(transaction_id);
                return Err(e);
            }
            debug!("Session {} completed transaction {transaction_id} ({kind:?})", self.session_id);
        }
        self.begin().await
    }

    async fn send_transaction(
        &self,
        connection: &Connection,
        transaction_id: &TransactionId,
        kind: TransactionType,
    ) -> Result<()> {
        let info = TransactionInfo {
            connection_id: connection.connection_id().clone(),
            transaction_id: transaction_id.clone(),
            kind,
        };
        connection.send(Command::new(CommandKind::TransactionInfo(info))).await
    }

    pub(crate) fn deregister_producer(&self, producer_id: &ProducerId) {
        self.producers.remove(producer_id);
    }

    /// Close every consumer and producer, roll back an open transaction and
    /// remove the session on the broker. Idempotent.
    ///
    /// Every step runs even if an earlier one fails; the first failure is returned.
    ///
    /// # Errors
    /// Returns the first failure met while closing.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut first_error = None;
        let consumers: Vec<_> = self.consumers.iter().map(|entry| Arc::clone(entry.value())).collect();
        for consumer in consumers {
            if let Err(e) = consumer.close().await {
                first_error.get_or_insert(e);
            }
        }
        let producers: Vec<_> = self.producers.iter().map(|entry| Arc::clone(entry.value())).collect();
        for producer in producers {
            if let Err(e) = producer.close().await {
                first_error.get_or_insert(e);
            }
        }

        if let Some(connection) = self.connection.upgrade() {
            let transaction_id = self.transaction.lock().take();
            if let Some(transaction_id) = transaction_id {
                if let Err(e) = self.send_transaction(&connection, &transaction_id, TransactionType::Rollback).await {
                    first_error.get_or_insert(e);
                }
            }
            let remove = RemoveInfo { object_id: ObjectId::Session(self.session_id.clone()) };
            if let Err(e) = connection.send(Command::new(CommandKind::RemoveInfo(remove))).await {
                first_error.get_or_insert(e);
            }
            connection.deregister_session(&self.session_id);
        }
        info!("Session {} closed", self.session_id);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ConsumerSession for Session {
    async fn oneway(&self, command: Command) -> Result<()> {
        self.connection()?.send(command).await
    }

    fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.mode
    }

    fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction.lock().clone()
    }

    async fn remove_consumer(&self, consumer_id: &ConsumerId) -> Result<()> {
        self.consumers.remove(consumer_id);
        let connection = self.connection()?;
        connection.deregister_consumer(consumer_id);
        let remove = RemoveInfo { object_id: ObjectId::Consumer(consumer_id.clone()) };
        connection.send(Command::new(CommandKind::RemoveInfo(remove))).await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("mode", &self.mode)
            .field("consumers", &self.consumers.len())
            .field("producers", &self.producers.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
