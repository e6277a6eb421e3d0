//! Interactive shell on a pty

use std::io::Write;
use std::sync::Arc;

use portable_pty::CommandBuilder;
use tokio::io::AsyncReadExt;
use tokio_util::io::SyncIoBridge;

use super::pty::{Pty, PtyProcess};
use super::SessionContext;
use crate::bridge::{Origin, Teardown};
use crate::channel::{ChannelControl, DuplexStream};

const CHUNK: usize = 8192;

/// Login shell command with the session environment
pub(super) fn command(ctx: &SessionContext, term: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&ctx.shell);
    for (key, value) in ctx.environment(Some(term)) {
        cmd.env(key, value);
    }
    if let Some(home) = ctx.home() {
        cmd.cwd(home);
    }
    cmd
}

/// Bridge the pty master and the channel until either side ends
///
/// Teardown closes the channel, kills the shell, drops the master and
/// reaps the child, in that order.
pub(super) fn launch<S: DuplexStream + 'static>(
    process: PtyProcess,
    pty: Arc<Pty>,
    stream: S,
    control: Arc<dyn ChannelControl>,
    teardown: Teardown,
) {
    let PtyProcess {
        mut child,
        mut reader,
        writer,
    } = process;
    let mut killer = child.clone_killer();
    let (mut channel_rx, channel_tx) = tokio::io::split(stream);

    // pty -> channel; the blocking read ends with EIO once the shell is gone
    let mut sink = SyncIoBridge::new(channel_tx);
    let out_teardown = teardown.clone();
    let outbound = tokio::task::spawn_blocking(move || {
        let result = std::io::copy(&mut reader, &mut sink);
        let _ = sink.shutdown();
        out_teardown.trigger(Origin::Outbound);
        if let Err(e) = result {
            tracing::trace!("PTY output ended: {}", e);
        }
    });

    // channel -> pty; each chunk is written on the blocking pool
    let in_teardown = teardown.clone();
    let inbound = tokio::spawn(async move {
        let mut writer = Some(writer);
        let mut buf = vec![0u8; CHUNK];

        loop {
            let n = tokio::select! {
                _ = in_teardown.triggered() => break,
                read = channel_rx.read(&mut buf) => match read {
                    Ok(0) | Err(_) => {
                        in_teardown.trigger(Origin::Inbound);
                        break;
                    }
                    Ok(n) => n,
                },
            };

            let Some(mut w) = writer.take() else { break };
            let chunk = buf[..n].to_vec();
            let written = tokio::task::spawn_blocking(move || {
                let result = w.write_all(&chunk).and_then(|_| w.flush());
                (w, result)
            })
            .await;

            match written {
                Ok((w, Ok(()))) => writer = Some(w),
                Ok((_, Err(e))) => {
                    tracing::trace!("PTY input ended: {}", e);
                    in_teardown.trigger(Origin::Inbound);
                    break;
                }
                Err(_) => break,
            }
        }
    });

    tokio::spawn(async move {
        teardown.triggered().await;

        control.close().await;
        let _ = killer.kill();
        pty.close();

        match tokio::task::spawn_blocking(move || child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("Shell exited with code {}", status.exit_code()),
            Ok(Err(e)) => tracing::warn!("Failed to reap shell: {}", e),
            Err(e) => tracing::warn!("Shell reaper task failed: {}", e),
        }

        let _ = inbound.await;
        let _ = outbound.await;
        tracing::debug!("Shell channel torn down ({:?})", teardown.origin());
    });
}
