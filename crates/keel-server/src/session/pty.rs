//! Pseudo-terminal for one session channel

use std::io::{Read, Write};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize, SlavePty};

use keel_protocol::TerminalSize;

/// A pty pair plus its current size
///
/// The subordinate end is consumed by the one process spawned on it; the
/// master stays until [`close`](Self::close).
pub struct Pty {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    slave: Mutex<Option<Box<dyn SlavePty + Send>>>,
    size: Mutex<TerminalSize>,
}

/// A process running on the pty, with master-side I/O handles
pub struct PtyProcess {
    pub child: Box<dyn Child + Send + Sync>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Pty {
    /// Open a new pty pair
    pub fn open(size: TerminalSize) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .with_context(|| "Failed to open PTY")?;

        tracing::debug!("Opened PTY at {}", size);

        Ok(Self {
            master: Mutex::new(Some(pair.master)),
            slave: Mutex::new(Some(pair.slave)),
            size: Mutex::new(size),
        })
    }

    pub fn size(&self) -> TerminalSize {
        *lock(&self.size)
    }

    /// Resize the master; a closed pty only records the size
    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        if let Some(master) = lock(&self.master).as_ref() {
            master
                .resize(pty_size(size))
                .with_context(|| "Failed to resize PTY")?;
        }
        *lock(&self.size) = size;
        Ok(())
    }

    /// Spawn `cmd` as session leader with the subordinate as controlling tty
    pub fn spawn(&self, cmd: CommandBuilder) -> Result<PtyProcess> {
        let slave = lock(&self.slave)
            .take()
            .ok_or_else(|| anyhow::anyhow!("PTY already has a process"))?;

        let child = slave
            .spawn_command(cmd)
            .with_context(|| "Failed to spawn process on PTY")?;
        // the master only sees EOF once no subordinate handle is left open here
        drop(slave);

        tracing::debug!("Spawned PTY process with PID {:?}", child.process_id());

        let guard = lock(&self.master);
        let master = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("PTY is closed"))?;
        let reader = master
            .try_clone_reader()
            .with_context(|| "Failed to clone PTY reader")?;
        let writer = master
            .take_writer()
            .with_context(|| "Failed to take PTY writer")?;

        Ok(PtyProcess {
            child,
            reader,
            writer,
        })
    }

    /// Drop both ends; `true` only on the first call
    pub fn close(&self) -> bool {
        lock(&self.slave).take();
        let closed = lock(&self.master).take().is_some();
        if closed {
            tracing::debug!("Closed PTY");
        }
        closed
    }

    pub fn is_open(&self) -> bool {
        lock(&self.master).is_some()
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        self.close();
    }
}
