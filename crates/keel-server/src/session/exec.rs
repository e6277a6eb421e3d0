//! One-shot commands without a pty

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::io::ReaderStream;

use super::SessionContext;
use crate::bridge::{Origin, Teardown};
use crate::channel::{ChannelControl, DuplexStream};

/// A spawned `<shell> -c <command>` with its pipes
pub(super) struct ExecProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

fn missing(pipe: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("child {} was not piped", pipe))
}

pub(super) fn spawn(ctx: &SessionContext, command: &str) -> io::Result<ExecProcess> {
    let mut cmd = Command::new(&ctx.shell);
    cmd.arg("-c")
        .arg(command)
        .envs(ctx.environment(None))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(home) = ctx.home() {
        cmd.current_dir(home);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    tracing::debug!("Spawned exec process with PID {:?}", child.id());

    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    Ok(ExecProcess {
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Copy merged stdout/stderr into `sink` until both are closed
async fn pump_output<W: AsyncWrite + Unpin>(
    stdout: ChildStdout,
    stderr: ChildStderr,
    sink: &mut W,
) -> io::Result<u64> {
    let mut merged = futures::stream::select(ReaderStream::new(stdout), ReaderStream::new(stderr));
    let mut total = 0u64;

    while let Some(chunk) = merged.next().await {
        let chunk = chunk?;
        sink.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    sink.flush().await?;
    Ok(total)
}

/// Wire the process to the channel and close the channel when it exits
///
/// Client EOF only closes the child's stdin.
pub(super) fn launch<S: DuplexStream + 'static>(
    process: ExecProcess,
    stream: S,
    control: Arc<dyn ChannelControl>,
    teardown: Teardown,
) {
    let ExecProcess {
        mut child,
        mut stdin,
        stdout,
        stderr,
    } = process;
    let (mut channel_rx, mut channel_tx) = tokio::io::split(stream);

    let in_teardown = teardown.clone();
    let inbound = tokio::spawn(async move {
        tokio::select! {
            _ = in_teardown.triggered() => {}
            result = tokio::io::copy(&mut channel_rx, &mut stdin) => {
                if let Err(e) = result {
                    tracing::trace!("Exec stdin ended: {}", e);
                }
            }
        }
        let _ = stdin.shutdown().await;
    });

    tokio::spawn(async move {
        let finished: Option<io::Result<ExitStatus>> = tokio::select! {
            status = async {
                if let Err(e) = pump_output(stdout, stderr, &mut channel_tx).await {
                    tracing::debug!("Exec output ended: {}", e);
                }
                child.wait().await
            } => Some(status),
            _ = teardown.triggered() => None,
        };

        match finished {
            Some(status) => {
                teardown.trigger(Origin::Exited);
                match status {
                    Ok(status) => tracing::debug!("Exec process exited: {}", status),
                    Err(e) => tracing::warn!("Failed to wait for exec process: {}", e),
                }
            }
            None => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        let _ = channel_tx.shutdown().await;
        control.close().await;

        inbound.abort();
        let _ = inbound.await;
        tracing::debug!("Exec channel torn down ({:?})", teardown.origin());
    });
}
