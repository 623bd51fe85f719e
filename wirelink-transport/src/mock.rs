//! # Mock Network
//!
//! In-memory transports for testing failover without sockets.
//!
//! A [`MockNetwork`] is a registry of named hosts. `mock://<host>` URIs connect to
//! a registered host that is up; every attempt is recorded, successful or not.
//! Each connection is a [`MockTransport`] that records what is sent on it, can be
//! fed inbound commands and can be made to fail.
//!
//! ```rust
//! use wirelink_transport::{MockNetwork, TransportFactory};
//!
//! # async fn demo() -> wirelink_core::Result<()> {
//! let network = MockNetwork::new();
//! network.register_host("broker-a");
//!
//! let factory = TransportFactory::with_mock_network(network.clone());
//! let transport = factory.connect(&"mock://broker-a".parse().unwrap()).await?;
//! assert!(transport.is_connected());
//! # Ok(())
//! # }
//! ```

use crate::correlator::RequestTable;
use crate::transport::{Transport, TransportKind, TransportListener};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, trace};
use url::Url;
use wirelink_core::{Command, Error, Result};

// ================================================================================================
// Network
// ================================================================================================

#[derive(Debug, Clone, Copy)]
struct HostState {
    up: bool,
    auto_respond: bool,
}

#[derive(Default)]
struct NetworkInner {
    hosts: DashMap<String, HostState>,
    attempts: Mutex<Vec<String>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

/// Registry of simulated broker hosts. Clones share the same network.
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<NetworkInner>,
}

impl MockNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host that accepts connections and answers every
    /// response-required command with a `Response`.
    pub fn register_host(&self, host: &str) {
        self.inner.hosts.insert(host.to_string(), HostState { up: true, auto_respond: true });
    }

    /// Let a host accept or refuse new connections. Existing connections are
    /// unaffected; see [`MockNetwork::kill_host`].
    pub fn set_host_up(&self, host: &str, up: bool) {
        if let Some(mut state) = self.inner.hosts.get_mut(host) {
            state.up = up;
        }
    }

    /// Make a host answer response-required commands automatically or not.
    pub fn set_auto_respond(&self, host: &str, auto_respond: bool) {
        if let Some(mut state) = self.inner.hosts.get_mut(host) {
            state.auto_respond = auto_respond;
        }
    }

    /// Take a host down and fail every open connection to it.
    pub async fn kill_host(&self, host: &str) {
        self.set_host_up(host, false);
        for transport in self.transports_for(host) {
            if transport.is_connected() {
                transport.fail(Error::io(format!("{host} went down"))).await;
            }
        }
    }

    /// Hosts of every connection attempt, in order.
    #[must_use]
    pub fn connect_attempts(&self) -> Vec<String> {
        self.inner.attempts.lock().clone()
    }

    /// Number of connection attempts to one host.
    #[must_use]
    pub fn attempts_to(&self, host: &str) -> usize {
        self.inner.attempts.lock().iter().filter(|attempt| *attempt == host).count()
    }

    /// Every transport ever connected to a host, oldest first.
    #[must_use]
    pub fn transports_for(&self, host: &str) -> Vec<Arc<MockTransport>> {
        self.inner.transports.lock().iter().filter(|t| t.host() == host).cloned().collect()
    }

    /// The most recent transport connected to a host.
    #[must_use]
    pub fn last_transport(&self, host: &str) -> Option<Arc<MockTransport>> {
        self.transports_for(host).pop()
    }

    /// Wait until a host has at least `count` transports, polling every millisecond.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] if the count is not reached within `timeout`.
    pub async fn wait_for_transports(&self, host: &str, count: usize, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.transports_for(host).len() < count {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::timeout(format!("waiting for {count} transports to {host}"), timeout));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok(())
    }

    pub(crate) fn connect(&self, uri: &Url) -> Result<Arc<MockTransport>> {
        let host = uri.host_str().unwrap_or_default().to_string();
        self.inner.attempts.lock().push(host.clone());

        let state = self.inner.hosts.get(&host).map(|state| *state);
        match state {
            Some(HostState { up: true, auto_respond }) => {
                let transport = Arc::new(MockTransport::new(uri.clone(), host, auto_respond));
                self.inner.transports.lock().push(Arc::clone(&transport));
                debug!("Mock connection established to {uri}");
                Ok(transport)
            },
            Some(_) => Err(Error::io(format!("Connection refused: {uri}"))),
            None => Err(Error::io(format!("Unknown host: {uri}"))),
        }
    }
}

impl fmt::Debug for MockNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockNetwork")
            .field("hosts", &self.inner.hosts.len())
            .field("attempts", &self.inner.attempts.lock().len())
            .finish()
    }
}

// ================================================================================================
// Transport
// ================================================================================================

/// One simulated connection to a [`MockNetwork`] host.
pub struct MockTransport {
    uri: Url,
    host: String,
    auto_respond: bool,
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
    sent: Mutex<Vec<Command>>,
    requests: RequestTable,
    started: AtomicBool,
    failed: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    fn new(uri: Url, host: String, auto_respond: bool) -> Self {
        Self {
            uri,
            host,
            auto_respond,
            listener: RwLock::new(None),
            sent: Mutex::new(Vec::new()),
            requests: RequestTable::new(),
            started: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Host this transport is connected to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Every command successfully sent on this transport, in order.
    #[must_use]
    pub fn sent_commands(&self) -> Vec<Command> {
        self.sent.lock().clone()
    }

    /// Deliver a command as if the broker had sent it.
    pub async fn inject_command(&self, command: Command) {
        if command.is_response() && self.requests.complete(&command) {
            return;
        }
        let listener = self.listener.read().clone();
        match listener {
            Some(listener) => listener.on_command(command).await,
            None => trace!("Dropping {command} on {}: no listener", self.uri),
        }
    }

    /// Break the connection and report `error` to the listener.
    pub async fn fail(&self, error: Error) {
        if self.failed.swap(true, Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return;
        }
        debug!("Mock transport to {} failing: {error}", self.uri);
        self.requests.fail_all(&error);
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_exception(error).await;
        }
    }

    fn check_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::closed(format!("mock transport to {} is closed", self.uri)));
        }
        if self.failed.load(Ordering::SeqCst) {
            return Err(Error::io(format!("mock transport to {} has failed", self.uri)));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> Result<()> {
        self.check_usable()?;
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Mock transport to {} closed", self.uri);
            self.requests.fail_all(&Error::closed("mock transport closed"));
        }
        Ok(())
    }

    async fn oneway(&self, command: Command) -> Result<()> {
        self.check_usable()?;
        trace!("Mock send to {}: {command}", self.uri);
        self.sent.lock().push(command.clone());

        if self.auto_respond && command.response_required {
            self.inject_command(command.response()).await;
        }
        Ok(())
    }

    async fn request(&self, command: Command, timeout: Option<Duration>) -> Result<Command> {
        let mut command = command;
        self.requests.prepare(&mut command);
        let command_id = command.command_id;
        let receiver = self.requests.register(&command, false);

        if let Err(e) = self.oneway(command).await {
            self.requests.cancel(command_id);
            return Err(e);
        }
        self.requests.wait(command_id, receiver, timeout).await
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.listener.write() = Some(listener);
    }

    fn is_connected(&self) -> bool {
        self.started.load(Ordering::SeqCst)
            && !self.failed.load(Ordering::SeqCst)
            && !self.closed.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn remote_address(&self) -> Option<String> {
        Some(self.uri.to_string())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Mock
    }

    fn as_mock(&self) -> Option<&MockTransport> {
        Some(self)
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("uri", &self.uri.as_str())
            .field("connected", &self.is_connected())
            .field("sent", &self.sent.lock().len())
            .finish()
    }
}
