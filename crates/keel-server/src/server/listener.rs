//! SSH server listener
//!
//! Accepts incoming connections and spawns a handler task for each client.

use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::server::handler::ConnectionHandler;
use crate::state::ServerState;

/// SSH server that listens for incoming connections
pub struct SshServer {
    /// Shared server state
    state: Arc<ServerState>,
    /// russh server configuration
    ssh_config: Arc<russh::server::Config>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl SshServer {
    pub fn new(host_key: KeyPair, state: Arc<ServerState>, cancel: CancellationToken) -> Self {
        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.auth_rejection_time = Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(Duration::from_secs(0));

        Self {
            state,
            ssh_config: Arc::new(config),
            cancel,
        }
    }

    /// Bind `bind_addr` and serve until shutdown
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Accept on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("SSH server listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("SSH server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::info!("New connection from {}", peer_addr);
        self.state.stats.connection_accepted();

        let config = Arc::clone(&self.ssh_config);
        let stats = Arc::clone(&self.state.stats);
        let cancel = self.cancel.child_token();
        let authenticated = Arc::new(AtomicBool::new(false));
        let handler = ConnectionHandler::new(
            Arc::clone(&self.state),
            peer_addr,
            cancel.clone(),
            Arc::clone(&authenticated),
        );

        tokio::spawn(async move {
            let result = match russh::server::run_stream(config, socket, handler).await {
                Ok(running) => {
                    let handle = running.handle();
                    tokio::select! {
                        result = running => result,
                        _ = cancel.cancelled() => {
                            tracing::debug!("Disconnecting {} for shutdown", peer_addr);
                            let _ = handle
                                .disconnect(
                                    russh::Disconnect::ByApplication,
                                    "server shutting down".to_string(),
                                    "en".to_string(),
                                )
                                .await;
                            return;
                        }
                    }
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => tracing::info!("Connection from {} closed normally", peer_addr),
                Err(e) => {
                    if !authenticated.load(Ordering::Acquire) {
                        stats.handshake_failed();
                    }
                    tracing::warn!("Connection from {} closed with error: {}", peer_addr, e);
                }
            }
        });
    }
}

/// Load the host key, generating and persisting one on first start
pub async fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        tracing::info!("Loading host key from {:?}", path);
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {:?}", path))?;
        return Ok(key);
    }

    tracing::info!("Generating new host key at {:?}", path);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("Failed to encode host key")?;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to create host key file {:?}", path))?;
    file.write_all(&pem)
        .and_then(|_| file.sync_all())
        .with_context(|| format!("Failed to write host key to {:?}", path))?;

    Ok(key)
}
