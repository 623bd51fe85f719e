//! # Connection
//!
//! A [`Connection`] owns one [`FailoverTransport`], the id generator shared by
//! everything created on it, and the registry that routes broker dispatches to
//! consumers. Sessions, consumers and producers reference the connection weakly.

use crate::{config::ClientConfig, session::Session};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, trace, warn};
use wirelink_consumer::{ConsumerConfig, MessageConsumer};
use wirelink_core::{
    command::{ConnectionInfo, ObjectId, RemoveInfo, SessionInfo},
    types::{AcknowledgeMode, IdGenerator},
    Command, CommandKind, ConnectionId, ConsumerId, Error, Result, SessionId,
};
use wirelink_transport::{FailoverTransport, Transport, TransportFactory, TransportListener};

/// Receives terminal connection failures and errors raised on the dispatch path.
pub trait ExceptionListener: Send + Sync {
    /// Handle an error.
    fn on_exception(&self, error: Error);
}

impl<F> ExceptionListener for F
where
    F: Fn(Error) + Send + Sync,
{
    fn on_exception(&self, error: Error) {
        self(error);
    }
}

/// Observes failover interruptions.
pub trait ConnectionListener: Send + Sync {
    /// The broker connection was lost; queued messages have been discarded.
    fn transport_interrupted(&self) {}

    /// The connection was re-established and its state replayed.
    fn transport_resumed(&self) {}
}

/// A client connection to a broker (or a failover set of brokers).
pub struct Connection {
    config: ClientConfig,
    info: ConnectionInfo,
    ids: IdGenerator,
    transport: Arc<FailoverTransport>,
    sessions: DashMap<SessionId, Arc<Session>>,
    consumers: DashMap<ConsumerId, Arc<MessageConsumer>>,
    exception_listener: RwLock<Option<Arc<dyn ExceptionListener>>>,
    connection_listener: RwLock<Option<Arc<dyn ConnectionListener>>>,
    start_lock: AsyncMutex<()>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Connection {
    /// Create a connection. Nothing is sent until [`Connection::start`].
    ///
    /// # Errors
    /// Returns [`Error::InvalidUri`] for a malformed broker URI.
    pub fn create(config: ClientConfig, factory: TransportFactory) -> Result<Arc<Self>> {
        let parsed = config.failover_uri()?;
        let connection_id = ConnectionId::generate();
        let client_id = config.client_id.clone().unwrap_or_else(|| format!("wirelink-{}", uuid::Uuid::new_v4()));
        let transport = FailoverTransport::new(parsed.uris, parsed.config, factory);

        let info = ConnectionInfo {
            connection_id: connection_id.clone(),
            client_id,
            user_name: config.user_name.clone(),
            fault_tolerant: true,
        };
        info!("Created connection {connection_id} for {}", config.broker_uri);

        let connection = Arc::new_cyclic(|weak: &Weak<Self>| {
            transport.set_listener(Arc::new(ConnectionTransportListener { connection: weak.clone() }));
            Self {
                config,
                info,
                ids: IdGenerator::new(connection_id),
                transport,
                sessions: DashMap::new(),
                consumers: DashMap::new(),
                exception_listener: RwLock::new(None),
                connection_listener: RwLock::new(None),
                start_lock: AsyncMutex::new(()),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }
        });
        Ok(connection)
    }

    /// Connection id.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        self.ids.connection_id()
    }

    /// Client id announced to the broker.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.info.client_id
    }

    /// The configuration the connection was created with.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The underlying failover transport.
    #[must_use]
    pub const fn transport(&self) -> &Arc<FailoverTransport> {
        &self.transport
    }

    /// Whether [`Connection::start`] has completed.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Install the listener for terminal failures and dispatch errors.
    pub fn set_exception_listener(&self, listener: Option<Arc<dyn ExceptionListener>>) {
        *self.exception_listener.write() = listener;
    }

    /// Install the listener for interruptions and resumptions.
    pub fn set_connection_listener(&self, listener: Option<Arc<dyn ConnectionListener>>) {
        *self.connection_listener.write() = listener;
    }

    /// Start the transport and register the connection with the broker.
    /// Idempotent.
    ///
    /// # Errors
    /// Returns the startup failure of the transport, or the broker's refusal of
    /// the connection.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        self.check_open()?;
        if self.is_started() {
            return Ok(());
        }

        self.transport.start().await?;
        self.request(Command::new(CommandKind::ConnectionInfo(self.info.clone()))).await?;
        self.started.store(true, Ordering::SeqCst);
        info!("Connection {} started", self.connection_id());
        Ok(())
    }

    /// Create a session, starting the connection first if needed.
    ///
    /// # Errors
    /// Returns [`Error::TransportClosed`] on a closed connection, or the failure
    /// to start or to register the session.
    pub async fn create_session(self: &Arc<Self>, mode: AcknowledgeMode) -> Result<Arc<Session>> {
        self.start().await?;

        let session_id = self.ids.next_session_id();
        let session = Session::new(session_id.clone(), mode, self);
        self.request(Command::new(CommandKind::SessionInfo(SessionInfo { session_id: session_id.clone() })))
            .await?;
        self.sessions.insert(session_id.clone(), Arc::clone(&session));

        if mode == AcknowledgeMode::Transacted {
            if let Err(e) = session.begin().await {
                self.sessions.remove(&session_id);
                return Err(e);
            }
        }
        debug!("Created session {session_id} ({mode:?})");
        Ok(session)
    }

    /// Close every session and the transport. Idempotent.
    ///
    /// Every step runs even if an earlier one fails; the first failure is returned.
    ///
    /// # Errors
    /// Returns the first failure met while closing.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing connection {}", self.connection_id());

        let mut first_error = None;
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect();
        for session in sessions {
            if let Err(e) = session.close().await {
                first_error.get_or_insert(e);
            }
        }

        if self.is_started() {
            let remove = RemoveInfo { object_id: ObjectId::Connection(self.connection_id().clone()) };
            if let Err(e) = self.send(Command::new(CommandKind::RemoveInfo(remove))).await {
                debug!("Connection removal not delivered: {e}");
            }
            if let Err(e) = self.send(Command::new(CommandKind::ShutdownInfo)).await {
                debug!("Shutdown notice not delivered: {e}");
            }
        }

        if let Err(e) = self.transport.close().await {
            first_error.get_or_insert(e);
        }
        self.sessions.clear();
        self.consumers.clear();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ============================================================================================
    // Crate-internal plumbing
    // ============================================================================================

    pub(crate) const fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    pub(crate) fn default_consumer_config(&self) -> &ConsumerConfig {
        &self.config.consumer
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed(format!("connection {} is closed", self.connection_id())));
        }
        Ok(())
    }

    /// Send without waiting for a response.
    pub(crate) async fn send(&self, command: Command) -> Result<()> {
        let command = command.with_command_id(self.ids.next_command_id());
        trace!("Sending {command}");
        self.transport.oneway(command).await
    }

    /// Send and wait for the broker's response.
    pub(crate) async fn request(&self, command: Command) -> Result<Command> {
        let command = command.with_command_id(self.ids.next_command_id()).with_response_required();
        trace!("Requesting {command}");
        self.transport.request(command, Some(self.request_timeout())).await
    }

    const fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    pub(crate) fn register_consumer(&self, consumer: &Arc<MessageConsumer>) {
        self.consumers.insert(consumer.consumer_id().clone(), Arc::clone(consumer));
    }

    pub(crate) fn deregister_consumer(&self, consumer_id: &ConsumerId) {
        self.consumers.remove(consumer_id);
    }

    pub(crate) fn deregister_session(&self, session_id: &SessionId) {
        self.sessions.remove(session_id);
    }

    fn report(&self, error: Error) {
        let listener = self.exception_listener.read().clone();
        match listener {
            Some(listener) => listener.on_exception(error),
            None => warn!("Unhandled connection error: {error}"),
        }
    }

    async fn on_command(&self, command: Command) {
        let name = command.name();
        match command.kind {
            CommandKind::MessageDispatch(dispatch) => {
                let consumer = self.consumers.get(&dispatch.consumer_id).map(|entry| Arc::clone(entry.value()));
                match consumer {
                    Some(consumer) => {
                        if let Err(e) = consumer.dispatch(dispatch).await {
                            self.report(e);
                        }
                    },
                    None => debug!("Dropping dispatch for unknown consumer {}", dispatch.consumer_id),
                }
            },
            CommandKind::ConnectionControl(_) | CommandKind::KeepAliveInfo => {
                trace!("Connection {} received {name}", self.connection_id());
            },
            _ => debug!("Ignoring unexpected {name} on connection {}", self.connection_id()),
        }
    }

    fn on_interrupted(&self) {
        warn!("Connection {} interrupted", self.connection_id());
        for entry in &self.consumers {
            entry.value().clear_message_queue();
        }
        let listener = self.connection_listener.read().clone();
        if let Some(listener) = listener {
            listener.transport_interrupted();
        }
    }

    fn on_resumed(&self) {
        info!("Connection {} resumed", self.connection_id());
        let listener = self.connection_listener.read().clone();
        if let Some(listener) = listener {
            listener.transport_resumed();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connection_id", self.connection_id())
            .field("client_id", &self.info.client_id)
            .field("sessions", &self.sessions.len())
            .field("consumers", &self.consumers.len())
            .field("started", &self.is_started())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Routes transport events to the owning connection.
struct ConnectionTransportListener {
    connection: Weak<Connection>,
}

#[async_trait]
impl TransportListener for ConnectionTransportListener {
    async fn on_command(&self, command: Command) {
        if let Some(connection) = self.connection.upgrade() {
            connection.on_command(command).await;
        }
    }

    async fn on_exception(&self, error: Error) {
        if let Some(connection) = self.connection.upgrade() {
            warn!("Connection {} failed: {error}", connection.connection_id());
            connection.report(error);
        }
    }

    async fn transport_interrupted(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.on_interrupted();
        }
    }

    async fn transport_resumed(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.on_resumed();
        }
    }
}
