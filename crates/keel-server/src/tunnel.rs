//! direct-tcpip tunnels
//!
//! The destination is dialed before the channel is accepted, so a refused
//! or unreachable destination rejects the open and nothing is spawned.

use std::sync::Arc;
use std::time::Duration;

use keel_core::config::ForwardingConfig;
use keel_protocol::ForwardTarget;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::bridge::{self, Teardown};
use crate::channel::{ChannelControl, DuplexStream};

/// Why a tunnel could not be established
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Forwarding to {0} is not permitted")]
    Forbidden(String),

    #[error("Timed out connecting to {0}")]
    Timeout(String),

    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection closed while dialing")]
    Cancelled,
}

/// Decides which destinations a client may reach
pub trait ForwardPolicy: Send + Sync + 'static {
    fn allow(&self, target: &ForwardTarget) -> bool;
}

/// Permits every destination
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ForwardPolicy for AllowAll {
    fn allow(&self, _target: &ForwardTarget) -> bool {
        true
    }
}

/// Policy from the `[forwarding]` section
#[derive(Debug, Clone)]
pub struct ConfiguredPolicy {
    enabled: bool,
    allowed_hosts: Option<Vec<String>>,
}

impl ConfiguredPolicy {
    pub fn new(config: &ForwardingConfig) -> Self {
        Self {
            enabled: config.enabled,
            allowed_hosts: config.allowed_hosts.clone(),
        }
    }

    pub fn into_shared(self) -> Arc<dyn ForwardPolicy> {
        Arc::new(self)
    }
}

impl ForwardPolicy for ConfiguredPolicy {
    fn allow(&self, target: &ForwardTarget) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.allowed_hosts {
            None => true,
            Some(hosts) => hosts.iter().any(|h| h.eq_ignore_ascii_case(&target.host)),
        }
    }
}

/// Connect to `target` unless the policy vetoes it
pub async fn dial(
    target: &ForwardTarget,
    policy: &dyn ForwardPolicy,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<TcpStream, TunnelError> {
    let address = target.address();
    if !policy.allow(target) {
        return Err(TunnelError::Forbidden(address));
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        result = tokio::time::timeout(timeout, TcpStream::connect(&address)) => match result {
            Err(_) => Err(TunnelError::Timeout(address)),
            Ok(Err(source)) => Err(TunnelError::Connect { address, source }),
            Ok(Ok(socket)) => {
                if let Err(e) = socket.set_nodelay(true) {
                    tracing::debug!("Failed to set TCP_NODELAY: {}", e);
                }
                Ok(socket)
            }
        },
    }
}

/// Bridge an accepted channel and its socket until either side ends
pub async fn run_tunnel<S: DuplexStream + 'static>(
    stream: S,
    socket: TcpStream,
    control: Arc<dyn ChannelControl>,
    teardown: Teardown,
) {
    let (inbound, outbound) = bridge::pipe(stream, socket, &teardown);

    teardown.triggered().await;
    control.close().await;

    let sent = inbound.await.unwrap_or(0);
    let received = outbound.await.unwrap_or(0);
    tracing::debug!(
        "Tunnel closed ({:?}): {} bytes sent, {} bytes received",
        teardown.origin(),
        sent,
        received
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Origin;
    use crate::session::tests::RecordingControl;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn target(host: &str, port: u16) -> ForwardTarget {
        ForwardTarget::new(host, port as u32, "127.0.0.1", 50000).unwrap()
    }

    #[test]
    fn test_configured_policy() {
        let mut config = ForwardingConfig::default();
        assert!(ConfiguredPolicy::new(&config).allow(&target("anywhere", 22)));

        config.allowed_hosts = Some(vec!["LocalHost".to_string()]);
        let policy = ConfiguredPolicy::new(&config);
        assert!(policy.allow(&target("localhost", 22)));
        assert!(!policy.allow(&target("example.com", 22)));

        config.enabled = false;
        assert!(!ConfiguredPolicy::new(&config).allow(&target("localhost", 22)));
    }

    #[tokio::test]
    async fn test_forbidden_host_refused() {
        let mut config = ForwardingConfig::default();
        config.enabled = false;
        let policy = ConfiguredPolicy::new(&config);

        let err = dial(&target("127.0.0.1", 1), &policy, Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_unreachable_destination_errors() {
        // grab a free port, then close it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = dial(&target("127.0.0.1", port), &AllowAll, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_dial() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        // 192.0.2.0/24 is reserved for documentation and never answers
        let err = dial(&target("192.0.2.1", 9), &AllowAll, Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Cancelled));
    }

    #[tokio::test]
    async fn test_tunnel_echoes_and_closes_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let echo = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let socket = dial(&target("127.0.0.1", port), &AllowAll, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        let control = Arc::new(RecordingControl::default());
        let teardown = Teardown::new(&CancellationToken::new());
        let (channel, mut client) = tokio::io::duplex(1024);
        let tunnel = tokio::spawn(run_tunnel(channel, socket, control.clone(), teardown.clone()));

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        echo.await.unwrap();
        tunnel.await.unwrap();

        assert_eq!(control.closes(), 1);
        assert_eq!(teardown.origin(), Some(Origin::Outbound));
    }
}
