//! [`ChannelControl`] over a russh session handle

use async_trait::async_trait;
use russh::server::Handle;
use russh::ChannelId;

use crate::channel::ChannelControl;

/// One channel of a live russh connection
pub struct RusshChannel {
    handle: Handle,
    id: ChannelId,
}

impl RusshChannel {
    pub fn new(handle: Handle, id: ChannelId) -> Self {
        Self { handle, id }
    }
}

#[async_trait]
impl ChannelControl for RusshChannel {
    async fn close(&self) {
        if self.handle.close(self.id).await.is_err() {
            tracing::debug!("Close on channel {:?} dropped: connection gone", self.id);
        }
    }
}
