//! Global server state

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keel_core::ServerConfig;

use crate::auth::PasswordAuthenticator;
use crate::session::FileTransferService;
use crate::tunnel::ForwardPolicy;

/// State shared by every connection
pub struct ServerState {
    /// Configuration
    pub config: ServerConfig,
    /// Password verification backend
    pub authenticator: Arc<PasswordAuthenticator>,
    /// Serves the `sftp` subsystem
    pub file_transfer: Arc<dyn FileTransferService>,
    /// Vetoes direct-tcpip destinations
    pub forward_policy: Arc<dyn ForwardPolicy>,
    /// Shell spawned for `shell` and `exec`
    pub shell: PathBuf,
    /// Counters
    pub stats: Arc<ServerStats>,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        authenticator: PasswordAuthenticator,
        file_transfer: Arc<dyn FileTransferService>,
        forward_policy: Arc<dyn ForwardPolicy>,
    ) -> Self {
        let shell = config.resolve_shell();
        Self {
            config,
            authenticator: Arc::new(authenticator),
            file_transfer,
            forward_policy,
            shell,
            stats: Arc::new(ServerStats::default()),
        }
    }
}

/// Connection and channel counters
#[derive(Debug, Default)]
pub struct ServerStats {
    connections_accepted: AtomicU64,
    handshake_failures: AtomicU64,
    auth_successes: AtomicU64,
    auth_failures: AtomicU64,
    channels_opened: AtomicU64,
    channels_closed: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub handshake_failures: u64,
    pub auth_successes: u64,
    pub auth_failures: u64,
    pub channels_opened: u64,
    pub channels_open: u64,
}

impl ServerStats {
    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_attempt(&self, accepted: bool) {
        let counter = if accepted {
            &self.auth_successes
        } else {
            &self.auth_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_closed(&self) {
        self.channels_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let opened = self.channels_opened.load(Ordering::Relaxed);
        let closed = self.channels_closed.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            auth_successes: self.auth_successes.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            channels_opened: opened,
            channels_open: opened.saturating_sub(closed),
        }
    }
}
