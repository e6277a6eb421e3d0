//! File transfer subsystem

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::bridge::{Origin, Teardown};
use crate::channel::{ChannelControl, DuplexStream};

/// Errors from a file transfer session
#[derive(Error, Debug)]
pub enum FileTransferError {
    /// The server program could not be started
    #[error("Failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Copying between channel and server failed
    #[error("File transfer I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server program exited unsuccessfully
    #[error("File transfer server exited with status {0:?}")]
    Exited(Option<i32>),
}

/// Serves one file transfer session over a raw channel stream
///
/// `Ok(())` means the client ended the session normally.
#[async_trait]
pub trait FileTransferService: Send + Sync + 'static {
    async fn serve(&self, stream: Box<dyn DuplexStream>) -> Result<(), FileTransferError>;
}

/// Runs an external `sftp-server` speaking SFTP on stdin/stdout
#[derive(Debug, Clone)]
pub struct SftpServerProcess {
    program: PathBuf,
}

impl SftpServerProcess {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl FileTransferService for SftpServerProcess {
    async fn serve(&self, stream: Box<dyn DuplexStream>) -> Result<(), FileTransferError> {
        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FileTransferError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let missing = || std::io::Error::new(std::io::ErrorKind::Other, "sftp server pipes missing");
        let mut stdin = child.stdin.take().ok_or_else(missing)?;
        let mut stdout = child.stdout.take().ok_or_else(missing)?;
        let (mut channel_rx, mut channel_tx) = tokio::io::split(stream);

        let upload = tokio::spawn(async move {
            let copied = tokio::io::copy(&mut channel_rx, &mut stdin).await;
            let _ = stdin.shutdown().await;
            copied
        });

        let downloaded = tokio::io::copy(&mut stdout, &mut channel_tx).await;
        let _ = channel_tx.shutdown().await;
        upload.abort();
        downloaded?;

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(FileTransferError::Exited(status.code()))
        }
    }
}

/// Hand the channel to `service` and close it when the session ends
pub(super) fn launch<S: DuplexStream + 'static>(
    service: Arc<dyn FileTransferService>,
    stream: S,
    control: Arc<dyn ChannelControl>,
    teardown: Teardown,
) {
    tokio::spawn(async move {
        let result = tokio::select! {
            result = service.serve(Box::new(stream)) => Some(result),
            _ = teardown.triggered() => None,
        };

        match result {
            Some(Ok(())) => tracing::debug!("File transfer session ended"),
            Some(Err(e)) => tracing::warn!("File transfer session failed: {}", e),
            None => tracing::debug!("File transfer session cancelled"),
        }

        teardown.trigger(Origin::Exited);
        control.close().await;
    });
}
