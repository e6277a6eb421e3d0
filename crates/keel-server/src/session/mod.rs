//! Session channels
//!
//! One [`SessionHandler`] per `session` channel drains that channel's
//! requests in order and owns whatever they provision:
//!
//! ```text
//! Idle --pty-req--> PtyAllocated --shell|exec|subsystem--> Active --> Closed
//!   \______________________________________________________/
//! ```
//!
//! The first activity request claims the channel; later ones are declined.
//! Each request is answered through the [`Routed`] it arrived in, so the
//! transport can reply in request order.

mod exec;
mod pty;
mod sftp;
mod shell;

pub use pty::{Pty, PtyProcess};
pub use sftp::{FileTransferError, FileTransferService, SftpServerProcess};

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use keel_passwd::SystemAccount;
use keel_protocol::{ChannelRequest, RequestKind, TerminalSize, SFTP_SUBSYSTEM};

use crate::bridge::{Origin, Teardown};
use crate::channel::{ChannelControl, DuplexStream};

/// Terminal type when pty-req did not name one
pub const DEFAULT_TERM: &str = "xterm";

/// Who the session runs as and what it may start
pub struct SessionContext {
    pub username: String,
    pub account: Option<SystemAccount>,
    pub shell: PathBuf,
    pub file_transfer: Arc<dyn FileTransferService>,
}

impl SessionContext {
    /// Environment for spawned processes
    pub fn environment(&self, term: Option<&str>) -> Vec<(String, String)> {
        let mut env = vec![
            ("USER".to_string(), self.username.clone()),
            ("LOGNAME".to_string(), self.username.clone()),
            ("SHELL".to_string(), self.shell.display().to_string()),
        ];
        if let Some(term) = term {
            env.push(("TERM".to_string(), term.to_string()));
        }
        if let Some(account) = &self.account {
            env.push(("HOME".to_string(), account.home.display().to_string()));
        }
        env
    }

    /// Working directory for spawned processes
    pub fn home(&self) -> Option<&std::path::Path> {
        self.account
            .as_ref()
            .map(|a| a.home.as_path())
            .filter(|home| home.is_dir())
    }
}

/// A request queued for its channel's handler
pub struct Routed {
    pub request: ChannelRequest,
    /// Takes the reply when the peer asked for one
    pub reply: Option<oneshot::Sender<bool>>,
}

impl Routed {
    /// Wrap `request`, returning the receiving end of its reply if it wants one
    pub fn new(request: ChannelRequest) -> (Self, Option<oneshot::Receiver<bool>>) {
        if request.want_reply {
            let (tx, rx) = oneshot::channel();
            (
                Self {
                    request,
                    reply: Some(tx),
                },
                Some(rx),
            )
        } else {
            (
                Self {
                    request,
                    reply: None,
                },
                None,
            )
        }
    }
}

/// The long-lived activity a channel is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Shell,
    Exec,
    Subsystem,
}

/// Where a session channel is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    PtyAllocated,
    Active(Activity),
    Closed,
}

/// Request-driven state machine for one session channel
pub struct SessionHandler<S> {
    control: Arc<dyn ChannelControl>,
    stream: Option<S>,
    ctx: Arc<SessionContext>,
    state: SessionState,
    pty: Option<Arc<Pty>>,
    term: Option<String>,
    teardown: Teardown,
}

impl<S: DuplexStream + 'static> SessionHandler<S> {
    pub fn new(
        control: Arc<dyn ChannelControl>,
        stream: S,
        ctx: Arc<SessionContext>,
        teardown: Teardown,
    ) -> Self {
        Self {
            control,
            stream: Some(stream),
            ctx,
            state: SessionState::Idle,
            pty: None,
            term: None,
            teardown,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current pty size, if one is allocated
    pub fn pty_size(&self) -> Option<TerminalSize> {
        self.pty.as_ref().map(|pty| pty.size())
    }

    pub fn teardown(&self) -> &Teardown {
        &self.teardown
    }

    /// Drain requests until the channel closes or its activity ends
    pub async fn run(mut self, mut requests: mpsc::Receiver<Routed>) {
        loop {
            tokio::select! {
                biased;
                _ = self.teardown.triggered() => break,
                routed = requests.recv() => match routed {
                    Some(Routed { request, reply }) => {
                        let answer = self.handle(request);
                        if let (Some(tx), Some(ok)) = (reply, answer) {
                            let _ = tx.send(ok);
                        }
                    }
                    None => {
                        self.teardown.trigger(Origin::ChannelClosed);
                        break;
                    }
                },
            }
        }

        // queued requests are declined, not left waiting on the close below
        drop(requests);
        self.finish().await;
    }

    /// Decide one request; `Some` carries the reply the peer asked for
    pub fn handle(&mut self, request: ChannelRequest) -> Option<bool> {
        let want_reply = request.want_reply;
        tracing::debug!("Channel request: {}", request.kind.name());

        let ok = match request.kind {
            RequestKind::WindowChange { size } => {
                self.window_change(size);
                return None;
            }
            RequestKind::PtyReq { term, size } => self.pty_req(term, size),
            RequestKind::Shell { payload } => {
                if !payload.is_empty() {
                    tracing::debug!("Declining shell request with {} byte payload", payload.len());
                    false
                } else if !self.can_start() {
                    false
                } else {
                    match self.prepare_shell() {
                        Ok((process, pty)) => {
                            self.activate(Activity::Shell, |stream, control, teardown| {
                                shell::launch(process, pty, stream, control, teardown)
                            })
                        }
                        Err(e) => {
                            tracing::warn!("Failed to start shell: {:#}", e);
                            false
                        }
                    }
                }
            }
            RequestKind::Exec { command } => {
                if !self.can_start() {
                    false
                } else {
                    match exec::spawn(&self.ctx, &command) {
                        Ok(process) => self.activate(Activity::Exec, |stream, control, teardown| {
                            exec::launch(process, stream, control, teardown)
                        }),
                        Err(e) => {
                            tracing::warn!("Failed to spawn exec command: {}", e);
                            false
                        }
                    }
                }
            }
            RequestKind::Subsystem { name } => {
                if name != SFTP_SUBSYSTEM {
                    tracing::debug!("Declining unknown subsystem {:?}", name);
                    false
                } else if !self.can_start() {
                    false
                } else {
                    let service = Arc::clone(&self.ctx.file_transfer);
                    self.activate(Activity::Subsystem, |stream, control, teardown| {
                        sftp::launch(service, stream, control, teardown)
                    })
                }
            }
            RequestKind::Other { name } => {
                tracing::debug!("Declining {} request", name);
                false
            }
        };

        want_reply.then_some(ok)
    }

    fn can_start(&self) -> bool {
        match self.state {
            SessionState::Idle | SessionState::PtyAllocated => true,
            SessionState::Active(activity) => {
                tracing::debug!("Channel already running {:?}", activity);
                false
            }
            SessionState::Closed => false,
        }
    }

    fn pty_req(&mut self, term: String, size: TerminalSize) -> bool {
        if let Some(pty) = &self.pty {
            if let Err(e) = pty.resize(size) {
                tracing::warn!("Failed to resize PTY: {:#}", e);
                return false;
            }
            self.term = Some(term);
            return true;
        }

        if !matches!(self.state, SessionState::Idle) {
            return false;
        }

        match Pty::open(size) {
            Ok(pty) => {
                self.pty = Some(Arc::new(pty));
                self.term = Some(term);
                self.state = SessionState::PtyAllocated;
                true
            }
            Err(e) => {
                tracing::warn!("Failed to allocate PTY: {:#}", e);
                false
            }
        }
    }

    fn window_change(&mut self, size: TerminalSize) {
        if let Some(pty) = &self.pty {
            if let Err(e) = pty.resize(size) {
                tracing::warn!("Failed to resize PTY: {:#}", e);
            }
        }
    }

    fn prepare_shell(&mut self) -> anyhow::Result<(PtyProcess, Arc<Pty>)> {
        let pty = match &self.pty {
            Some(pty) => Arc::clone(pty),
            None => {
                let pty = Arc::new(Pty::open(TerminalSize::default_size())?);
                self.pty = Some(Arc::clone(&pty));
                self.state = SessionState::PtyAllocated;
                pty
            }
        };

        let term = self.term.as_deref().unwrap_or(DEFAULT_TERM);
        let process = pty.spawn(shell::command(&self.ctx, term))?;
        Ok((process, pty))
    }

    fn activate<F>(&mut self, activity: Activity, start: F) -> bool
    where
        F: FnOnce(S, Arc<dyn ChannelControl>, Teardown),
    {
        let Some(stream) = self.stream.take() else {
            tracing::error!("Channel stream already taken");
            return false;
        };
        self.state = SessionState::Active(activity);
        start(stream, Arc::clone(&self.control), self.teardown.clone());
        true
    }

    /// Release what no activity took over
    async fn finish(&mut self) {
        if !matches!(self.state, SessionState::Active(_)) {
            if let Some(pty) = self.pty.take() {
                pty.close();
            }
            self.control.close().await;
        }
        self.state = SessionState::Closed;
        tracing::debug!("Session channel finished ({:?})", self.teardown.origin());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    /// Counts closes
    #[derive(Default)]
    pub(crate) struct RecordingControl {
        pub closes: Mutex<usize>,
    }

    impl RecordingControl {
        pub fn closes(&self) -> usize {
            *self.closes.lock().unwrap()
        }
    }

    #[async_trait]
    impl ChannelControl for RecordingControl {
        async fn close(&self) {
            *self.closes.lock().unwrap() += 1;
        }
    }

    /// Refuses every transfer
    struct NoTransfer;

    #[async_trait]
    impl FileTransferService for NoTransfer {
        async fn serve(&self, _stream: Box<dyn DuplexStream>) -> Result<(), FileTransferError> {
            Ok(())
        }
    }

    fn context() -> Arc<SessionContext> {
        Arc::new(SessionContext {
            username: "alice".to_string(),
            account: None,
            shell: PathBuf::from("/bin/sh"),
            file_transfer: Arc::new(NoTransfer),
        })
    }

    fn handler() -> (
        SessionHandler<tokio::io::DuplexStream>,
        Arc<RecordingControl>,
        tokio::io::DuplexStream,
    ) {
        let control = Arc::new(RecordingControl::default());
        let (channel, client) = tokio::io::duplex(4096);
        let teardown = Teardown::new(&CancellationToken::new());
        let handler = SessionHandler::new(control.clone(), channel, context(), teardown);
        (handler, control, client)
    }

    fn request(kind: RequestKind, want_reply: bool) -> ChannelRequest {
        ChannelRequest::new(kind, want_reply)
    }

    fn pty_req(rows: u16, cols: u16) -> ChannelRequest {
        request(
            RequestKind::PtyReq {
                term: "xterm".to_string(),
                size: TerminalSize::new(rows, cols),
            },
            true,
        )
    }

    fn exec(command: &str) -> ChannelRequest {
        request(
            RequestKind::Exec {
                command: command.to_string(),
            },
            true,
        )
    }

    fn shell() -> ChannelRequest {
        request(RequestKind::Shell { payload: Bytes::new() }, true)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_pty_req_then_window_change() {
        let (mut handler, _control, _client) = handler();

        assert_eq!(handler.handle(pty_req(24, 80)), Some(true));
        assert_eq!(handler.state(), SessionState::PtyAllocated);
        assert_eq!(handler.pty_size(), Some(TerminalSize::new(24, 80)));

        let resize = request(
            RequestKind::WindowChange {
                size: TerminalSize::from_wire(120, 40),
            },
            false,
        );
        assert_eq!(handler.handle(resize), None);
        assert_eq!(handler.pty_size(), Some(TerminalSize::new(40, 120)));
    }

    #[tokio::test]
    async fn test_window_change_never_replies() {
        let (mut handler, _control, _client) = handler();

        // even a peer that asks for a reply gets none
        let resize = request(
            RequestKind::WindowChange {
                size: TerminalSize::new(10, 10),
            },
            true,
        );
        assert_eq!(handler.handle(resize), None);
        assert_eq!(handler.pty_size(), None);
        assert_eq!(handler.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_repeated_pty_req_resizes() {
        let (mut handler, _control, _client) = handler();

        assert_eq!(handler.handle(pty_req(24, 80)), Some(true));
        assert_eq!(handler.handle(pty_req(50, 132)), Some(true));
        assert_eq!(handler.pty_size(), Some(TerminalSize::new(50, 132)));
    }

    #[tokio::test]
    async fn test_unknown_requests_declined() {
        let (mut handler, _control, _client) = handler();

        let x11 = request(RequestKind::Other { name: "x11-req".to_string() }, true);
        let env = request(RequestKind::Other { name: "env".to_string() }, false);
        let netconf = request(RequestKind::Subsystem { name: "netconf".to_string() }, true);

        assert_eq!(handler.handle(x11), Some(false));
        assert_eq!(handler.handle(env), None);
        assert_eq!(handler.handle(netconf), Some(false));
        assert_eq!(handler.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_shell_with_payload_declined() {
        let (mut handler, _control, _client) = handler();

        let with_payload = request(
            RequestKind::Shell {
                payload: Bytes::from_static(b"extra"),
            },
            true,
        );
        assert_eq!(handler.handle(with_payload), Some(false));
        assert_eq!(handler.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_exec_streams_output_and_closes_once() {
        let (mut handler, control, mut client) = handler();

        assert_eq!(handler.handle(exec("echo hello; echo oops >&2")), Some(true));
        assert_eq!(handler.state(), SessionState::Active(Activity::Exec));

        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        assert!(output.contains("hello\n"));
        assert!(output.contains("oops\n"));

        handler.teardown().triggered().await;
        eventually(|| control.closes() == 1).await;
        assert_eq!(handler.teardown().origin(), Some(Origin::Exited));
    }

    #[tokio::test]
    async fn test_second_activity_declined() {
        let (mut handler, control, _client) = handler();

        assert_eq!(handler.handle(exec("sleep 5")), Some(true));
        assert_eq!(handler.handle(exec("true")), Some(false));
        assert_eq!(handler.handle(shell()), Some(false));

        handler.teardown().trigger(Origin::ChannelClosed);
        eventually(|| control.closes() == 1).await;
    }

    #[tokio::test]
    async fn test_exec_reads_stdin() {
        let (mut handler, _control, mut client) = handler();

        assert_eq!(handler.handle(exec("head -n 1")), Some(true));
        client.write_all(b"from client\n").await.unwrap();

        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "from client\n");
    }

    #[tokio::test]
    async fn test_shell_allocates_default_pty() {
        let (mut handler, control, mut client) = handler();

        assert_eq!(handler.handle(shell()), Some(true));
        assert_eq!(handler.pty_size(), Some(TerminalSize::new(24, 80)));
        assert_eq!(handler.state(), SessionState::Active(Activity::Shell));

        client.write_all(b"exit\n").await.unwrap();
        handler.teardown().triggered().await;
        eventually(|| control.closes() == 1).await;
    }

    #[tokio::test]
    async fn test_run_answers_each_request_in_order() {
        let (handler, control, _client) = handler();
        let (tx, rx) = mpsc::channel(8);

        let (pty, pty_reply) = Routed::new(pty_req(24, 80));
        let (sub, sub_reply) = Routed::new(request(
            RequestKind::Subsystem {
                name: "netconf".to_string(),
            },
            true,
        ));
        let (resize, resize_reply) = Routed::new(request(
            RequestKind::WindowChange {
                size: TerminalSize::new(40, 120),
            },
            false,
        ));
        assert!(resize_reply.is_none());

        tx.send(pty).await.unwrap();
        tx.send(sub).await.unwrap();
        tx.send(resize).await.unwrap();
        drop(tx);

        handler.run(rx).await;
        assert_eq!(pty_reply.unwrap().await, Ok(true));
        assert_eq!(sub_reply.unwrap().await, Ok(false));
        assert_eq!(control.closes(), 1);
    }

    #[tokio::test]
    async fn test_requests_after_teardown_are_dropped() {
        let (handler, control, _client) = handler();
        let (tx, rx) = mpsc::channel(8);

        handler.teardown().trigger(Origin::ChannelClosed);
        let (late, late_reply) = Routed::new(shell());
        tx.send(late).await.unwrap();

        handler.run(rx).await;
        // the sender side sees the drop and declines on the peer's behalf
        assert!(late_reply.unwrap().await.is_err());
        assert_eq!(control.closes(), 1);
    }

    #[tokio::test]
    async fn test_subsystem_sftp_hands_over_stream() {
        let (mut handler, control, _client) = handler();

        let sftp = request(RequestKind::Subsystem { name: "sftp".to_string() }, true);
        assert_eq!(handler.handle(sftp), Some(true));
        assert_eq!(handler.state(), SessionState::Active(Activity::Subsystem));

        handler.teardown().triggered().await;
        eventually(|| control.closes() == 1).await;
    }
}
