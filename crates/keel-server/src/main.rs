//! keel SSH server daemon
//!
//! Serves interactive shells, commands, sftp and direct-tcpip tunnels to
//! password-authenticated clients.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keel_core::config::{self, ServerConfig};
use keel_passwd::AuthContext;
use keel_server::auth::PasswordAuthenticator;
use keel_server::server::{load_or_generate_host_key, SshServer};
use keel_server::session::SftpServerProcess;
use keel_server::tunnel::ConfiguredPolicy;
use keel_server::ServerState;

#[derive(Parser)]
#[command(name = "keeld")]
#[command(about = "keel SSH server daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "KEEL_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("keeld starting...");

    let mut config: ServerConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                ServerConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            ServerConfig::default()
        }
    };

    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    config.validate().context("Invalid configuration")?;

    let host_key = load_or_generate_host_key(&config.host_key_path).await?;
    if let Ok(public) = host_key.clone_public_key() {
        tracing::info!("Host key fingerprint: {}", public.fingerprint());
    }

    let authenticator = PasswordAuthenticator::from_config(&config.auth, AuthContext::system())
        .context("Failed to set up password authentication")?;
    tracing::info!("Password backend: {:?}", config.auth.backend);

    let file_transfer = Arc::new(SftpServerProcess::new(&config.sftp_server));
    let forward_policy = ConfiguredPolicy::new(&config.forwarding).into_shared();
    let bind_addr = config.bind_address.clone();

    let state = Arc::new(ServerState::new(
        config,
        authenticator,
        file_transfer,
        forward_policy,
    ));

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let server = SshServer::new(host_key, Arc::clone(&state), cancel);

    tracing::info!("Starting SSH server on {}", bind_addr);
    server.run(&bind_addr).await?;

    let stats = state.stats.snapshot();
    tracing::info!(
        "keeld shutdown complete: {} connections, {} handshake failures, {} auth failures, {} channels",
        stats.connections_accepted,
        stats.handshake_failures,
        stats.auth_failures,
        stats.channels_opened
    );
    Ok(())
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}
