//! # Failover Transport
//!
//! A [`Transport`] that keeps exactly one underlying transport active and
//! replaces it when it fails.
//!
//! ```text
//! Disconnected ──start──▶ Connecting ──connected──▶ Connected
//!                              ▲                        │
//!                              └───────failure──────────┘
//!            any state ──close / attempts exhausted──▶ Closed
//! ```
//!
//! Reconnection runs on a [`CompositeTaskRunner`], one candidate per iteration.
//! A successful connect replays the [`ConnectionStateTracker`] snapshot and
//! reissues unanswered requests before the new transport becomes active, so no
//! caller traffic can overtake the replay. Callers that send while disconnected
//! wait in arrival order until the transport reconnects, closes, or the
//! configured `timeout` elapses.

use super::backup_pool::BackupTransportPool;
use super::listener::FailoverTransportListener;
use super::uri_pool::UriPool;
use crate::correlator::RequestTable;
use crate::state::ConnectionStateTracker;
use crate::threads::{CloseTransportsTask, CompositeTask, CompositeTaskRunner};
use crate::transport::{Transport, TransportFactory, TransportKind, TransportListener};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use url::Url;
use wirelink_core::{
    command::ConnectionControl,
    config::{parse_uri_list, FailoverConfig, FailoverUri},
    Command, CommandKind, Error, Result,
};

/// Connection state of a [`FailoverTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// Created, not started
    Disconnected,
    /// Looking for a broker
    Connecting,
    /// An underlying transport is active
    Connected,
    /// Closed for good
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveTransport {
    id: u64,
    uri: Url,
    transport: Arc<dyn Transport>,
}

#[derive(Debug, Default)]
struct FailoverState {
    active: Option<ActiveTransport>,
    /// Transport whose inbound commands are accepted; set before replay starts
    accepting_id: u64,
    next_transport_id: u64,
    connect_failures: u32,
    connected_once: bool,
    started: bool,
    stopped: bool,
    closed: bool,
    failure: Option<Error>,
    failed_uri: Option<Url>,
}

type ResponseReceiver = oneshot::Receiver<Result<Command>>;

/// Fault-tolerant transport over a set of candidate brokers.
pub struct FailoverTransport {
    config: FailoverConfig,
    factory: TransportFactory,
    self_ref: Weak<FailoverTransport>,
    uris: Arc<UriPool>,
    initial_uris: Vec<Url>,
    updated_uris: Mutex<Vec<Url>>,
    backups: Arc<BackupTransportPool>,
    tracker: ConnectionStateTracker,
    requests: RequestTable,
    state: Mutex<FailoverState>,
    status: watch::Sender<TransportState>,
    /// Serializes senders so that callers blocked on a reconnect resume in arrival order
    send_gate: tokio::sync::Mutex<()>,
    /// Held shared while tracking and sending, exclusively while activating a transport
    switch_lock: tokio::sync::RwLock<()>,
    reconnect_lock: tokio::sync::Mutex<()>,
    runner: CompositeTaskRunner,
    close_task: Arc<CloseTransportsTask>,
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
}

impl FailoverTransport {
    /// Create a failover transport over `uris`. Nothing connects until [`Transport::start`].
    #[must_use]
    pub fn new(uris: Vec<Url>, config: FailoverConfig, factory: TransportFactory) -> Arc<Self> {
        let pool = Arc::new(UriPool::new(uris.iter().cloned(), config.randomize));
        let backups = BackupTransportPool::new(factory.clone(), Arc::clone(&pool), config.backup_pool_size);
        let (status, _) = watch::channel(TransportState::Disconnected);

        Arc::new_cyclic(|self_ref| Self {
            tracker: ConnectionStateTracker::from_config(&config),
            config,
            factory,
            self_ref: self_ref.clone(),
            uris: pool,
            initial_uris: uris,
            updated_uris: Mutex::new(Vec::new()),
            backups,
            requests: RequestTable::new(),
            state: Mutex::new(FailoverState::default()),
            status,
            send_gate: tokio::sync::Mutex::new(()),
            switch_lock: tokio::sync::RwLock::new(()),
            reconnect_lock: tokio::sync::Mutex::new(()),
            runner: CompositeTaskRunner::new("failover"),
            close_task: Arc::new(CloseTransportsTask::new()),
            listener: RwLock::new(None),
        })
    }

    /// Create a failover transport from a `failover:(...)?options` URI.
    ///
    /// # Errors
    /// Returns [`Error::InvalidUri`] if the URI or one of its options is malformed.
    pub fn from_uri(uri: &str, factory: TransportFactory) -> Result<Arc<Self>> {
        let FailoverUri { uris, config } = FailoverUri::parse(uri)?;
        Ok(Self::new(uris, config, factory))
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Current state of the state machine.
    #[must_use]
    pub fn state(&self) -> TransportState {
        *self.status.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.status.subscribe()
    }

    /// URI of the active transport, if connected.
    #[must_use]
    pub fn connected_uri(&self) -> Option<Url> {
        self.state.lock().active.as_ref().map(|active| active.uri.clone())
    }

    /// Consecutive failed connection attempts since the last successful connect.
    #[must_use]
    pub fn connect_failures(&self) -> u32 {
        self.state.lock().connect_failures
    }

    /// Candidate broker URIs.
    #[must_use]
    pub fn uri_pool(&self) -> &UriPool {
        &self.uris
    }

    /// Pre-connected backup transports.
    #[must_use]
    pub fn backup_pool(&self) -> &BackupTransportPool {
        &self.backups
    }

    /// Recorded broker-side state.
    #[must_use]
    pub const fn state_tracker(&self) -> &ConnectionStateTracker {
        &self.tracker
    }

    /// Add candidate URIs; with `rebalance`, reconnect even if connected.
    ///
    /// # Errors
    /// Returns the terminal error if the transport is closed and `rebalance` is set.
    pub async fn add_uris(&self, rebalance: bool, uris: impl IntoIterator<Item = Url> + Send) -> Result<()> {
        for uri in uris {
            self.uris.add(uri);
        }
        if rebalance {
            self.reconnect(true).await?;
        }
        Ok(())
    }

    /// Remove candidate URIs; with `rebalance`, reconnect even if connected.
    ///
    /// # Errors
    /// Returns the terminal error if the transport is closed and `rebalance` is set.
    pub async fn remove_uris(&self, rebalance: bool, uris: impl IntoIterator<Item = Url> + Send) -> Result<()> {
        for uri in uris {
            self.uris.remove(&uri);
        }
        if rebalance {
            self.reconnect(true).await?;
        }
        Ok(())
    }

    /// Replace the broker-supplied URIs.
    ///
    /// URIs from the previous update that are neither configured nor in `uris`
    /// are dropped from the pool; the new ones are added.
    ///
    /// # Errors
    /// Returns the terminal error if the transport is closed and `rebalance` is set.
    pub async fn update_uris(&self, rebalance: bool, uris: Vec<Url>) -> Result<()> {
        let previous = std::mem::replace(&mut *self.updated_uris.lock(), uris.clone());
        for uri in previous {
            if !self.initial_uris.contains(&uri) && !uris.contains(&uri) {
                self.uris.remove(&uri);
            }
        }
        debug!("Broker URI list updated with {} entries", uris.len());
        self.add_uris(rebalance, uris).await
    }

    /// Trigger a reconnect. With `rebalance` the active transport is dropped
    /// and another broker is preferred; otherwise the runner is only woken.
    ///
    /// # Errors
    /// Returns the terminal error if the transport is closed.
    pub async fn reconnect(&self, rebalance: bool) -> Result<()> {
        let active_id = {
            let state = self.state.lock();
            if state.closed {
                return Err(Self::terminal_error(&state));
            }
            state.active.as_ref().map(|active| active.id)
        };

        if rebalance {
            if let Some(id) = active_id {
                if self.detach_active(id) {
                    info!("Rebalancing away from the current broker");
                    self.notify_interrupted().await;
                }
            }
        }
        self.runner.wakeup();
        Ok(())
    }

    fn terminal_error(state: &FailoverState) -> Error {
        state.failure.clone().unwrap_or_else(|| Error::closed("failover transport is closed"))
    }

    fn upward_listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.read().clone()
    }

    fn set_status(&self, status: TransportState) {
        self.status.send_replace(status);
    }

    /// Drop the active transport if it still has `id`. Returns false for stale ids.
    fn detach_active(&self, id: u64) -> bool {
        let detached = {
            let mut state = self.state.lock();
            if state.closed || state.active.as_ref().map(|active| active.id) != Some(id) {
                return false;
            }
            let detached = state.active.take();
            state.accepting_id = 0;
            state.failed_uri = detached.as_ref().map(|active| active.uri.clone());
            self.set_status(TransportState::Connecting);
            detached
        };

        if let Some(detached) = detached {
            self.backups.set_active_uri(None);
            self.close_task.add(detached.transport);
        }
        self.runner.wakeup();
        true
    }

    async fn notify_interrupted(&self) {
        if let Some(listener) = self.upward_listener() {
            listener.transport_interrupted().await;
        }
    }

    /// Failure reported by (or observed on) an underlying transport.
    pub(crate) async fn handle_transport_failure(&self, transport_id: u64, error: Error) {
        if !self.detach_active(transport_id) {
            trace!("Ignoring failure of inactive transport {transport_id}: {error}");
            return;
        }
        warn!("Transport failed, reconnecting: {error}");
        self.notify_interrupted().await;
    }

    /// Inbound command from an underlying transport.
    pub(crate) async fn handle_command(&self, transport_id: u64, command: Command) {
        if self.state.lock().accepting_id != transport_id {
            trace!("Dropping {command} from inactive transport {transport_id}");
            return;
        }

        match &command.kind {
            CommandKind::Response(_) | CommandKind::ExceptionResponse(_) => {
                self.tracker.track_response(&command);
                if !self.requests.complete(&command) {
                    trace!("Unsolicited {command}");
                }
            },
            CommandKind::ShutdownInfo => self.handle_shutdown().await,
            CommandKind::ConnectionControl(control) => {
                self.handle_connection_control(control).await;
                self.forward(command).await;
            },
            _ => self.forward(command).await,
        }
    }

    async fn forward(&self, command: Command) {
        match self.upward_listener() {
            Some(listener) => listener.on_command(command).await,
            None => trace!("Dropping {command}: no listener"),
        }
    }

    async fn handle_shutdown(&self) {
        info!("Broker is shutting down the connection");
        // Closing from here would close the transport that is delivering this command.
        if let Some(this) = self.self_ref.upgrade() {
            tokio::spawn(async move {
                let _ = this.close().await;
            });
        }
        if let Some(listener) = self.upward_listener() {
            listener.on_exception(Error::closed("broker shut down the connection")).await;
        }
    }

    async fn handle_connection_control(&self, control: &ConnectionControl) {
        if control.close || control.exit {
            self.handle_shutdown().await;
            return;
        }

        if !control.reconnect_to.is_empty() {
            if self.config.reconnect_supported {
                match Url::parse(&control.reconnect_to) {
                    Ok(uri) => {
                        info!("Broker requested reconnect to {uri}");
                        self.uris.prioritize(uri);
                        if let Err(e) = self.reconnect(true).await {
                            debug!("Broker-directed reconnect ignored: {e}");
                        }
                    },
                    Err(e) => warn!("Ignoring malformed reconnect URI {}: {e}", control.reconnect_to),
                }
            } else {
                debug!("Broker-directed reconnect disabled; ignoring");
            }
        }

        if !control.connected_brokers.is_empty() {
            if !self.config.update_uris_supported {
                debug!("Broker URI updates disabled; ignoring");
                return;
            }
            match parse_uri_list(&control.connected_brokers) {
                Ok(uris) => {
                    if let Err(e) = self.update_uris(control.rebalance_connection, uris).await {
                        debug!("Broker URI update ignored: {e}");
                    }
                },
                Err(e) => warn!("Ignoring malformed broker list: {e}"),
            }
        }
    }

    // ============================================================================================
    // Sending
    // ============================================================================================

    /// Track and send a command, waiting for a connection as needed.
    ///
    /// With `register`, the command is entered into the request table just before
    /// its first send attempt and the response receiver is returned.
    async fn transmit(&self, command: Command, register: bool) -> Result<Option<ResponseReceiver>> {
        if command.is_shutdown_command() && !self.is_connected() {
            self.ensure_open()?;
            self.tracker.track(&command);
            debug!("Not sending {command} while disconnected");
            return Ok(None);
        }

        let operation = self.transmit_in_order(command, register);
        match self.config.timeout {
            Some(timeout) => tokio::time::timeout(timeout, operation)
                .await
                .map_err(|_| Error::timeout("send while disconnected", timeout))?,
            None => operation.await,
        }
    }

    async fn transmit_in_order(&self, command: Command, register: bool) -> Result<Option<ResponseReceiver>> {
        let _gate = self.send_gate.lock().await;
        let mut receiver = None;

        loop {
            if command.is_shutdown_command() && !self.is_connected() {
                self.ensure_open()?;
                self.tracker.track(&command);
                return Ok(receiver);
            }
            self.wait_for_connection().await?;

            let switch = self.switch_lock.read().await;
            let Some(active) = self.state.lock().active.clone() else {
                continue;
            };

            let tracked = self.tracker.track(&command);
            if register && receiver.is_none() {
                receiver = Some(self.requests.register(&command, tracked));
            }

            match active.transport.oneway(command.clone()).await {
                Ok(()) => return Ok(receiver),
                Err(e) => {
                    drop(switch);
                    self.handle_transport_failure(active.id, e).await;
                    // Replay or request reissue delivers these after reconnecting.
                    if tracked || receiver.is_some() {
                        return Ok(receiver);
                    }
                },
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        let state = self.state.lock();
        if state.closed {
            return Err(Self::terminal_error(&state));
        }
        Ok(())
    }

    async fn wait_for_connection(&self) -> Result<()> {
        let mut status = self.status.subscribe();
        let reached = status
            .wait_for(|state| matches!(state, TransportState::Connected | TransportState::Closed))
            .await
            .map(|state| *state)
            .map_err(|_| Error::closed("failover transport dropped"))?;

        if reached == TransportState::Closed {
            return Err(Self::terminal_error(&self.state.lock()));
        }
        Ok(())
    }

    // ============================================================================================
    // Reconnection
    // ============================================================================================

    fn needs_reconnect(&self) -> bool {
        let state = self.state.lock();
        state.started && !state.closed && state.active.is_none()
    }

    /// One reconnection attempt. Returns true if another attempt is needed.
    async fn iterate_reconnect(&self) -> bool {
        let _guard = self.reconnect_lock.lock().await;
        let (first_connection, failed_uri, attempt) = {
            let mut state = self.state.lock();
            if state.closed || !state.started || state.active.is_some() {
                return false;
            }
            (!state.connected_once, state.failed_uri.take(), state.connect_failures + 1)
        };

        let outcome = self
            .attempt_connect(failed_uri.as_ref())
            .instrument(info_span!("reconnect", attempt))
            .await;

        match outcome {
            Ok(()) => false,
            Err(e) => self.handle_connect_failure(first_connection, e).await,
        }
    }

    async fn attempt_connect(&self, failed_uri: Option<&Url>) -> Result<()> {
        let (uri, transport) = match self.backups.take() {
            Some(backup) => (backup.uri, backup.transport),
            None => {
                let uri = self
                    .uris
                    .get_next_excluding(failed_uri)
                    .ok_or_else(|| Error::configuration("no candidate broker URIs"))?;
                debug!("Attempting connection to {uri}");
                let transport = self.factory.connect(&uri).await?;
                (uri, transport)
            },
        };
        self.activate(uri, transport).await
    }

    async fn activate(&self, uri: Url, transport: Arc<dyn Transport>) -> Result<()> {
        let id = {
            let mut state = self.state.lock();
            state.next_transport_id += 1;
            state.accepting_id = state.next_transport_id;
            state.next_transport_id
        };
        transport.set_listener(Arc::new(FailoverTransportListener::new(id, self.self_ref.clone())));

        let switch = self.switch_lock.write().await;
        if let Err(e) = self.restore(transport.as_ref()).await {
            self.state.lock().accepting_id = 0;
            drop(switch);
            let _ = transport.close().await;
            return Err(e);
        }

        let resumed = {
            let mut state = self.state.lock();
            if state.closed {
                None
            } else {
                state.active = Some(ActiveTransport { id, uri: uri.clone(), transport: Arc::clone(&transport) });
                state.connect_failures = 0;
                let resumed = state.connected_once;
                state.connected_once = true;
                self.set_status(TransportState::Connected);
                Some((resumed, !state.stopped))
            }
        };
        drop(switch);

        let Some((resumed, backups_wanted)) = resumed else {
            let _ = transport.close().await;
            return Err(Error::closed("failover transport closed while connecting"));
        };

        info!("Connected to {uri}");
        self.backups.set_active_uri(Some(uri));
        if self.config.backup && backups_wanted {
            self.backups.set_enabled(true);
        }
        if resumed {
            if let Some(listener) = self.upward_listener() {
                listener.transport_resumed().await;
            }
        }
        Ok(())
    }

    /// Replay tracked state and reissue unanswered requests on a new transport.
    async fn restore(&self, transport: &dyn Transport) -> Result<()> {
        self.tracker.replay(transport).await?;
        for request in self.requests.reissuable() {
            debug!("Reissuing {request}");
            let name = request.to_string();
            transport
                .oneway(request)
                .await
                .map_err(|e| Error::Replay { message: format!("failed to reissue {name}: {e}") })?;
        }
        if !transport.is_connected() {
            return Err(Error::Replay { message: "transport failed during replay".to_string() });
        }
        Ok(())
    }

    async fn handle_connect_failure(&self, first_connection: bool, cause: Error) -> bool {
        let failures = {
            let mut state = self.state.lock();
            state.connect_failures += 1;
            state.connect_failures
        };

        if let Some(limit) = self.config.attempt_limit(first_connection) {
            if failures > limit {
                self.fail_permanently(first_connection, failures, cause).await;
                return false;
            }
        }

        let delay = self.config.reconnect_delay_for(failures);
        debug!("Connect attempt {failures} failed ({cause}); retrying in {delay:?}");
        self.backoff(delay).await;
        true
    }

    /// Sleep for `delay`, returning early if the transport closes.
    async fn backoff(&self, delay: Duration) {
        let mut status = self.status.subscribe();
        tokio::select! {
            () = tokio::time::sleep(delay) => {},
            _ = status.wait_for(|state| *state == TransportState::Closed) => {},
        }
    }

    async fn fail_permanently(&self, first_connection: bool, attempts: u32, cause: Error) {
        let message = cause.to_string();
        let failure = if first_connection {
            Error::StartupFailed { attempts, message }
        } else {
            Error::ConnectionFailed { attempts, message }
        };
        error!("Giving up on reconnection: {failure}");

        {
            let mut state = self.state.lock();
            state.closed = true;
            state.failure = Some(failure.clone());
            self.set_status(TransportState::Closed);
        }
        self.requests.fail_all(&failure);
        self.backups.close().await;
        self.runner.shutdown();

        if let Some(listener) = self.upward_listener() {
            listener.on_exception(failure).await;
        }
    }
}

#[async_trait]
impl Transport for FailoverTransport {
    async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Self::terminal_error(&state));
            }
            state.stopped = false;
            if state.started {
                return Ok(());
            }
            state.started = true;
            self.set_status(TransportState::Connecting);
        }

        info!("Starting failover transport over {} broker URIs", self.uris.len());
        self.runner.add_task(Arc::new(ReconnectTask { transport: self.self_ref.clone() }));
        self.runner.add_task(Arc::clone(&self.close_task) as Arc<dyn CompositeTask>);
        self.runner.start();
        self.runner.wakeup();

        let limited =
            self.config.startup_max_reconnect_attempts.is_some() || self.config.max_reconnect_attempts.is_some();
        if limited {
            self.wait_for_connection().await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.state.lock().stopped = true;
        self.backups.set_enabled(false);
        debug!("Failover transport stopped");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let active = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.accepting_id = 0;
            self.set_status(TransportState::Closed);
            state.active.take()
        };

        info!("Closing failover transport");
        self.requests.fail_all(&Error::closed("failover transport closed"));
        self.runner.shutdown();
        if let Some(active) = active {
            if let Err(e) = active.transport.close().await {
                debug!("Error closing transport to {}: {e}", active.uri);
            }
        }
        self.backups.close().await;
        Ok(())
    }

    async fn oneway(&self, command: Command) -> Result<()> {
        self.transmit(command, false).await.map(|_| ())
    }

    async fn request(&self, command: Command, timeout: Option<Duration>) -> Result<Command> {
        let mut command = command;
        self.requests.prepare(&mut command);
        let command_id = command.command_id;
        let response = command.response();

        let receiver = match self.transmit(command, true).await {
            Ok(Some(receiver)) => receiver,
            // Teardown while disconnected: the broker has already dropped the state.
            Ok(None) => return Ok(response),
            Err(e) => {
                self.requests.cancel(command_id);
                return Err(e);
            },
        };
        self.requests.wait(command_id, receiver, timeout).await
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.listener.write() = Some(listener);
    }

    fn is_connected(&self) -> bool {
        self.state.lock().active.as_ref().is_some_and(|active| active.transport.is_connected())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn is_fault_tolerant(&self) -> bool {
        true
    }

    fn remote_address(&self) -> Option<String> {
        self.connected_uri().map(|uri| uri.to_string())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Failover
    }

    fn as_failover(&self) -> Option<&FailoverTransport> {
        Some(self)
    }
}

impl fmt::Debug for FailoverTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailoverTransport")
            .field("state", &self.state())
            .field("connected_uri", &self.connected_uri().map(String::from))
            .field("uris", &self.uris.len())
            .field("pending_requests", &self.requests.len())
            .finish()
    }
}

impl Drop for FailoverTransport {
    fn drop(&mut self) {
        self.runner.shutdown();
    }
}

/// Reconnection work item for the task runner.
struct ReconnectTask {
    transport: Weak<FailoverTransport>,
}

#[async_trait]
impl CompositeTask for ReconnectTask {
    fn is_pending(&self) -> bool {
        self.transport.upgrade().is_some_and(|transport| transport.needs_reconnect())
    }

    async fn iterate(&self) -> bool {
        match self.transport.upgrade() {
            Some(transport) => transport.iterate_reconnect().await,
            None => false,
        }
    }
}
