//! Transport-agnostic view of a channel
//!
//! Session and tunnel code only sees a byte stream plus this control
//! handle, so it can be driven by russh in production and by in-memory
//! fakes in tests. Request replies are not sent through it: they go back
//! through the transport callback that delivered the request.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Out-of-band operations on one channel
#[async_trait]
pub trait ChannelControl: Send + Sync + 'static {
    /// Close the channel; EOF is left to the stream's own shutdown
    async fn close(&self);
}

/// A channel's bidirectional byte stream
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> DuplexStream for T {}
