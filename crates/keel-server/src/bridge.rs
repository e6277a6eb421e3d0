//! Single-fire teardown and bidirectional byte bridging

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// What ended a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Origin {
    /// Client to local side reached end of stream
    Inbound = 1,
    /// Local side to client reached end of stream
    Outbound = 2,
    /// The process or service behind the channel finished
    Exited = 3,
    /// The client closed the channel
    ChannelClosed = 4,
    /// The connection or server is going away
    Shutdown = 5,
}

impl Origin {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Inbound),
            2 => Some(Self::Outbound),
            3 => Some(Self::Exited),
            4 => Some(Self::ChannelClosed),
            5 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// Exactly-once teardown signal for one channel
///
/// Any party may [`trigger`](Self::trigger); the first caller wins the
/// compare-and-swap and broadcasts cancellation, every later call is a
/// no-op. The token is a child of the connection's, so a dropped
/// connection also fires it.
#[derive(Debug, Clone)]
pub struct Teardown {
    origin: Arc<AtomicU8>,
    token: CancellationToken,
}

impl Teardown {
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            origin: Arc::new(AtomicU8::new(0)),
            token: parent.child_token(),
        }
    }

    /// Fire the teardown; `true` only for the first caller
    pub fn trigger(&self, origin: Origin) -> bool {
        let won = self
            .origin
            .compare_exchange(0, origin as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.token.cancel();
        }
        won
    }

    /// Resolves once the teardown has fired
    pub fn triggered(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Who fired first; [`Origin::Shutdown`] if only the parent was cancelled
    pub fn origin(&self) -> Option<Origin> {
        match Origin::from_u8(self.origin.load(Ordering::Acquire)) {
            Some(origin) => Some(origin),
            None if self.token.is_cancelled() => Some(Origin::Shutdown),
            None => None,
        }
    }
}

/// Copy `reader` into `writer` until end of stream or teardown
///
/// On end of stream the writer is shut down and the teardown fired with
/// `origin`. Returns the number of bytes copied.
pub fn spawn_direction<R, W>(
    mut reader: R,
    mut writer: W,
    teardown: Teardown,
    origin: Origin,
) -> JoinHandle<u64>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let copied = tokio::select! {
            _ = teardown.triggered() => return 0,
            result = tokio::io::copy(&mut reader, &mut writer) => result,
        };

        let _ = writer.shutdown().await;
        teardown.trigger(origin);

        match copied {
            Ok(n) => {
                tracing::trace!("{:?} direction finished after {} bytes", origin, n);
                n
            }
            Err(e) => {
                tracing::debug!("{:?} direction ended with error: {}", origin, e);
                0
            }
        }
    })
}

/// Bridge a channel stream and a local stream in both directions
///
/// Returns the (inbound, outbound) copy tasks. Whichever finishes first
/// fires `teardown`; the other stops at its next suspension point.
pub fn pipe<C, L>(channel: C, local: L, teardown: &Teardown) -> (JoinHandle<u64>, JoinHandle<u64>)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    L: AsyncRead + AsyncWrite + Send + 'static,
{
    let (channel_rx, channel_tx) = tokio::io::split(channel);
    let (local_rx, local_tx) = tokio::io::split(local);

    let inbound = spawn_direction(channel_rx, local_tx, teardown.clone(), Origin::Inbound);
    let outbound = spawn_direction(local_rx, channel_tx, teardown.clone(), Origin::Outbound);
    (inbound, outbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_first_trigger_wins() {
        let teardown = Teardown::new(&CancellationToken::new());
        assert_eq!(teardown.origin(), None);

        assert!(teardown.trigger(Origin::Outbound));
        assert!(!teardown.trigger(Origin::Inbound));
        assert!(teardown.is_triggered());
        assert_eq!(teardown.origin(), Some(Origin::Outbound));
    }

    #[test]
    fn test_parent_cancel_reports_shutdown() {
        let parent = CancellationToken::new();
        let teardown = Teardown::new(&parent);
        parent.cancel();

        assert!(teardown.is_triggered());
        assert_eq!(teardown.origin(), Some(Origin::Shutdown));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_triggers_fire_once() {
        let teardown = Teardown::new(&CancellationToken::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let teardown = teardown.clone();
                let winners = winners.clone();
                tokio::spawn(async move {
                    let origin = if i % 2 == 0 { Origin::Inbound } else { Origin::Outbound };
                    if teardown.trigger(origin) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pipe_copies_both_ways() {
        let teardown = Teardown::new(&CancellationToken::new());
        let (channel, mut client) = tokio::io::duplex(1024);
        let (local, mut remote) = tokio::io::duplex(1024);
        let (_inbound, _outbound) = pipe(channel, local, &teardown);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert!(!teardown.is_triggered());
    }

    #[tokio::test]
    async fn test_pipe_tears_down_once_when_both_sides_close() {
        let teardown = Teardown::new(&CancellationToken::new());
        let (channel, client) = tokio::io::duplex(64);
        let (local, remote) = tokio::io::duplex(64);
        let (inbound, outbound) = pipe(channel, local, &teardown);

        drop(client);
        drop(remote);
        teardown.triggered().await;

        inbound.await.unwrap();
        outbound.await.unwrap();
        assert!(matches!(teardown.origin(), Some(Origin::Inbound | Origin::Outbound)));
        assert!(!teardown.trigger(Origin::Exited));
    }
}
