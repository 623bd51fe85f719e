//! Pre-connected backup transports.
//!
//! When enabled, the pool keeps up to `backup_pool_size` connected transports to
//! candidate URIs other than the active one. Refills run on spawned tasks so that
//! connection setup stays off the failover path. Backups that fail are dropped
//! and replaced.

use super::uri_pool::UriPool;
use crate::transport::{Transport, TransportFactory, TransportListener};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use url::Url;
use wirelink_core::{Command, Error};

/// A connected, unused transport and the URI it is connected to.
#[derive(Debug, Clone)]
pub struct BackupTransport {
    /// Broker the transport is connected to
    pub uri: Url,
    /// The connected transport
    pub transport: Arc<dyn Transport>,
}

#[derive(Debug, Default)]
struct PoolState {
    enabled: bool,
    size: usize,
    backups: Vec<BackupTransport>,
    active_uri: Option<Url>,
    refilling: bool,
    refill_requested: bool,
    closed: bool,
}

/// Bounded pool of backup transports.
pub struct BackupTransportPool {
    factory: TransportFactory,
    uris: Arc<UriPool>,
    self_ref: Weak<BackupTransportPool>,
    state: Mutex<PoolState>,
}

impl BackupTransportPool {
    /// Create a disabled pool drawing candidates from `uris`.
    #[must_use]
    pub fn new(factory: TransportFactory, uris: Arc<UriPool>, backup_pool_size: usize) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            factory,
            uris,
            self_ref: self_ref.clone(),
            state: Mutex::new(PoolState { size: backup_pool_size.max(1), ..PoolState::default() }),
        })
    }

    /// Enable or disable the pool. Disabling closes every held backup.
    pub fn set_enabled(&self, enabled: bool) {
        let dropped = {
            let mut state = self.state.lock();
            state.enabled = enabled;
            if enabled {
                Vec::new()
            } else {
                std::mem::take(&mut state.backups)
            }
        };
        Self::close_all(dropped);
        if enabled {
            self.refill();
        }
    }

    /// Whether the pool maintains backups.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Change the number of backups to keep. Surplus backups are closed.
    pub fn set_backup_pool_size(&self, size: usize) {
        let surplus = {
            let mut state = self.state.lock();
            state.size = size.max(1);
            let keep = state.size.min(state.backups.len());
            state.backups.split_off(keep)
        };
        Self::close_all(surplus);
        self.refill();
    }

    /// Number of backups to keep.
    #[must_use]
    pub fn backup_pool_size(&self) -> usize {
        self.state.lock().size
    }

    /// Number of backups currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().backups.len()
    }

    /// Whether no backup is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().backups.is_empty()
    }

    /// URIs of the held backups.
    #[must_use]
    pub fn backup_uris(&self) -> Vec<Url> {
        self.state.lock().backups.iter().map(|backup| backup.uri.clone()).collect()
    }

    /// Record the URI of the active transport; it is never used for a backup.
    pub fn set_active_uri(&self, uri: Option<Url>) {
        let mut state = self.state.lock();
        if let Some(uri) = &uri {
            state.backups.retain(|backup| &backup.uri != uri);
        }
        state.active_uri = uri;
    }

    /// Take a healthy backup, if any. Dead backups found on the way are closed.
    #[must_use]
    pub fn take(&self) -> Option<BackupTransport> {
        let (taken, dead) = {
            let mut state = self.state.lock();
            if !state.enabled {
                return None;
            }
            let mut dead = Vec::new();
            let mut taken = None;
            while !state.backups.is_empty() {
                let backup = state.backups.remove(0);
                if backup.transport.is_connected() {
                    taken = Some(backup);
                    break;
                }
                dead.push(backup);
            }
            (taken, dead)
        };

        Self::close_all(dead);
        if let Some(backup) = &taken {
            info!("Using backup transport to {}", backup.uri);
        }
        taken
    }

    /// Start filling the pool in the background if it is below size.
    pub fn refill(&self) {
        {
            let mut state = self.state.lock();
            if !state.enabled || state.closed || state.backups.len() >= state.size {
                return;
            }
            if state.refilling {
                state.refill_requested = true;
                return;
            }
            state.refilling = true;
        }
        let Some(pool) = self.self_ref.upgrade() else {
            self.state.lock().refilling = false;
            return;
        };
        tokio::spawn(async move {
            loop {
                pool.fill().await;
                let mut state = pool.state.lock();
                if !std::mem::take(&mut state.refill_requested) {
                    state.refilling = false;
                    break;
                }
            }
        });
    }

    /// Connect backups until the pool is full or candidates run out.
    async fn fill(&self) {
        for uri in self.uris.uris() {
            let wanted = {
                let state = self.state.lock();
                if !state.enabled || state.closed || state.backups.len() >= state.size {
                    return;
                }
                state.active_uri.as_ref() != Some(&uri) && !state.backups.iter().any(|b| b.uri == uri)
            };
            if !wanted {
                continue;
            }

            match self.factory.connect(&uri).await {
                Ok(transport) => {
                    transport.set_listener(Arc::new(BackupListener { pool: self.self_ref.clone(), uri: uri.clone() }));
                    let rejected = {
                        let mut state = self.state.lock();
                        let fits = state.enabled
                            && !state.closed
                            && state.backups.len() < state.size
                            && state.active_uri.as_ref() != Some(&uri);
                        if fits {
                            state.backups.push(BackupTransport { uri: uri.clone(), transport });
                            None
                        } else {
                            Some(transport)
                        }
                    };
                    match rejected {
                        None => debug!("Backup transport connected to {uri}"),
                        Some(transport) => Self::close_all(vec![BackupTransport { uri, transport }]),
                    }
                },
                Err(e) => debug!("Backup connection to {uri} failed: {e}"),
            }
        }
    }

    fn handle_backup_failure(&self, uri: &Url, error: &Error) {
        let removed = {
            let mut state = self.state.lock();
            let before = state.backups.len();
            state.backups.retain(|backup| &backup.uri != uri || backup.transport.is_connected());
            before != state.backups.len()
        };
        if removed {
            warn!("Backup transport to {uri} failed: {error}");
            self.refill();
        }
    }

    /// Disable the pool for good and close every backup.
    pub async fn close(&self) {
        let backups = {
            let mut state = self.state.lock();
            state.closed = true;
            state.enabled = false;
            std::mem::take(&mut state.backups)
        };
        for backup in backups {
            if let Err(e) = backup.transport.close().await {
                debug!("Error closing backup to {}: {e}", backup.uri);
            }
        }
    }

    fn close_all(backups: Vec<BackupTransport>) {
        if backups.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for backup in backups {
                let _ = backup.transport.close().await;
            }
        });
    }
}

impl std::fmt::Debug for BackupTransportPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BackupTransportPool")
            .field("enabled", &state.enabled)
            .field("size", &state.size)
            .field("held", &state.backups.len())
            .finish()
    }
}

/// Listener installed on idle backups; only failures matter.
struct BackupListener {
    pool: Weak<BackupTransportPool>,
    uri: Url,
}

#[async_trait]
impl TransportListener for BackupListener {
    async fn on_command(&self, command: Command) {
        debug!("Ignoring {command} received on idle backup to {}", self.uri);
    }

    async fn on_exception(&self, error: Error) {
        if let Some(pool) = self.pool.upgrade() {
            pool.handle_backup_failure(&self.uri, &error);
        }
    }
}
