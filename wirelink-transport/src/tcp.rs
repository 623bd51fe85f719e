//! TCP transport carrying framed commands.

use crate::correlator::RequestTable;
use crate::transport::{Transport, TransportKind, TransportListener};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    task::JoinHandle,
};
use tracing::{debug, trace, warn};
use url::Url;
use wirelink_core::{
    codec::{CommandDecoder, CommandEncoder},
    Command, Error, Result,
};

/// Port used when a `tcp://` URI names none.
pub const DEFAULT_PORT: u16 = 61616;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// A single TCP connection to a broker.
pub struct TcpTransport {
    uri: Url,
    self_ref: Weak<TcpTransport>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    encoder: Mutex<CommandEncoder>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
    requests: RequestTable,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Open a TCP connection to the broker named by a `tcp://host:port` URI.
    ///
    /// # Errors
    /// Returns [`Error::InvalidUri`] if the URI has no host and
    /// [`Error::TransportIo`] if the connection cannot be established.
    pub async fn connect(uri: &Url) -> Result<Arc<Self>> {
        let host = uri.host_str().ok_or_else(|| Error::InvalidUri {
            uri: uri.to_string(),
            message: "missing host".to_string(),
        })?;
        let port = uri.port().unwrap_or(DEFAULT_PORT);

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::io(format!("Failed to connect to {uri}: {e}")))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        debug!("TCP connection established to {uri}");

        Ok(Arc::new_cyclic(|self_ref| Self {
            uri: uri.clone(),
            self_ref: self_ref.clone(),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            encoder: Mutex::new(CommandEncoder::new()),
            read_task: Mutex::new(None),
            listener: RwLock::new(None),
            requests: RequestTable::new(),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }))
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut decoder = CommandDecoder::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        let error = loop {
            let read = match reader.read(&mut buffer).await {
                Ok(0) => break Error::io(format!("Connection to {} closed by peer", self.uri)),
                Ok(read) => read,
                Err(e) => break Error::from(e),
            };
            decoder.extend(&buffer[..read]);

            loop {
                match decoder.next_command() {
                    Ok(Some(command)) => self.dispatch(command).await,
                    Ok(None) => break,
                    Err(e) => return self.handle_failure(e).await,
                }
            }
        };

        self.handle_failure(error).await;
    }

    async fn dispatch(&self, command: Command) {
        trace!("Received {command} from {}", self.uri);
        if command.is_response() && self.requests.complete(&command) {
            return;
        }
        let listener = self.listener.read().clone();
        match listener {
            Some(listener) => listener.on_command(command).await,
            None => trace!("Dropping {command}: no listener installed"),
        }
    }

    async fn handle_failure(&self, error: Error) {
        if self.closed.load(Ordering::SeqCst) || !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!("TCP transport to {} failed: {error}", self.uri);
        self.requests.fail_all(&error);
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_exception(error).await;
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self) -> Result<()> {
        let Some(reader) = self.reader.lock().take() else {
            return Ok(());
        };
        let this = self.self_ref.upgrade().ok_or_else(|| Error::closed("transport dropped"))?;
        *self.read_task.lock() = Some(tokio::spawn(this.read_loop(reader)));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            // Peer may already be gone.
            let _ = writer.shutdown().await;
        }
        self.requests.fail_all(&Error::closed(format!("transport to {} closed", self.uri)));
        debug!("TCP transport to {} closed", self.uri);
        Ok(())
    }

    async fn oneway(&self, command: Command) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::closed(format!("transport to {} is closed", self.uri)));
        }
        let frame = self.encoder.lock().encode(&command)?;

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(Error::closed(format!("transport to {} is closed", self.uri)));
        };
        if let Err(e) = stream.write_all(&frame).await {
            drop(writer);
            let error = Error::io(format!("Write to {} failed: {e}", self.uri));
            self.handle_failure(error.clone()).await;
            return Err(error);
        }
        trace!("Sent {command} to {}", self.uri);
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
        self.connected.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn remote_address(&self) -> Option<String> {
        Some(self.uri.to_string())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("uri", &self.uri.as_str())
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}
