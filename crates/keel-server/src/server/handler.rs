//! russh connection handler
//!
//! Translates russh callbacks into [`ChannelRequest`]s and hands each
//! channel to its own task. A request that wants a reply holds its callback
//! until the channel's handler decides, then replies through the callback's
//! session: russh tracks one pending reply per channel, so a reply sent
//! after the next request arrived would be lost.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Pty, Sig};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use keel_protocol::{ChannelKind, ChannelRequest, ForwardTarget, RequestKind, TerminalSize};

use crate::bridge::Teardown;
use crate::server::control::RusshChannel;
use crate::server::dispatch::{Delivery, Dispatcher};
use crate::session::{Routed, SessionContext, SessionHandler};
use crate::state::ServerState;
use crate::tunnel;

/// Handler for a single SSH client connection
pub struct ConnectionHandler {
    /// Shared server state
    state: Arc<ServerState>,
    /// Peer address of the connecting client
    peer_addr: SocketAddr,
    /// Set once password authentication succeeds
    session_ctx: Option<Arc<SessionContext>>,
    /// Open channels
    dispatcher: Dispatcher<ChannelId>,
    /// Parent of every channel teardown; cancelled when the handler drops
    cancel: CancellationToken,
    authenticated: Arc<AtomicBool>,
}

impl ConnectionHandler {
    pub fn new(
        state: Arc<ServerState>,
        peer_addr: SocketAddr,
        cancel: CancellationToken,
        authenticated: Arc<AtomicBool>,
    ) -> Self {
        let limit = state.config.max_channels_per_connection;
        Self {
            state,
            peer_addr,
            session_ctx: None,
            dispatcher: Dispatcher::new(limit),
            cancel,
            authenticated,
        }
    }

    /// Queue a request for its channel's handler and send its reply
    async fn route(&self, channel: ChannelId, request: ChannelRequest, session: &mut Session) {
        let name = request.kind.name().to_string();
        let (routed, reply) = Routed::new(request);

        let ok = match self.dispatcher.deliver(channel, routed) {
            Delivery::Queued => match reply {
                // a handler that finished first dropped the request unanswered
                Some(reply) => reply.await.unwrap_or(false),
                None => return,
            },
            delivery => {
                tracing::debug!("Declining {} on channel {:?}: {:?}", name, channel, delivery);
                if reply.is_none() {
                    return;
                }
                false
            }
        };

        if ok {
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
    }

    fn refuse_open(&self, kind: &str) -> bool {
        match self.dispatcher.check(ChannelKind::classify(kind)) {
            Ok(()) => false,
            Err(refusal) => {
                tracing::info!("Rejected {} channel from {}: {}", kind, self.peer_addr, refusal);
                true
            }
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        // tears down every channel still running on this connection
        self.cancel.cancel();
        tracing::debug!(
            "Connection handler for {} dropped with {} open channels",
            self.peer_addr,
            self.dispatcher.open_channels()
        );
    }
}

#[async_trait]
impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let password = Zeroizing::new(password.to_string());
        let authenticator = Arc::clone(&self.state.authenticator);

        let accepted = authenticator.authenticate(user, password).await;
        self.state.stats.auth_attempt(accepted);

        if !accepted {
            tracing::info!("Password authentication failed from {}", self.peer_addr);
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        let account = authenticator.account(user).await;
        self.session_ctx = Some(Arc::new(SessionContext {
            username: user.to_string(),
            account,
            shell: self.state.shell.clone(),
            file_transfer: Arc::clone(&self.state.file_transfer),
        }));
        self.authenticated.store(true, Ordering::Release);

        tracing::info!("User {} authenticated from {}", user, self.peer_addr);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(ctx) = self.session_ctx.clone() else {
            return Ok(false);
        };
        let id = channel.id();

        let requests = match self.dispatcher.register_session(id) {
            Ok(requests) => requests,
            Err(refusal) => {
                tracing::info!("Rejected session channel from {}: {}", self.peer_addr, refusal);
                return Ok(false);
            }
        };

        let control = Arc::new(RusshChannel::new(session.handle(), id));
        let teardown = Teardown::new(&self.cancel);
        let handler = SessionHandler::new(control, channel.into_stream(), ctx, teardown);

        let stats = Arc::clone(&self.state.stats);
        stats.channel_opened();
        tokio::spawn(async move {
            handler.run(requests).await;
            stats.channel_closed();
        });

        tracing::debug!("Session channel {:?} opened", id);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.session_ctx.is_none() || self.refuse_open("direct-tcpip") {
            return Ok(false);
        }

        let target = match ForwardTarget::new(
            host_to_connect,
            port_to_connect,
            originator_address,
            originator_port,
        ) {
            Ok(target) => target,
            Err(e) => {
                tracing::info!("Rejected direct-tcpip channel from {}: {}", self.peer_addr, e);
                return Ok(false);
            }
        };

        let forwarding = &self.state.config.forwarding;
        let socket = match tunnel::dial(
            &target,
            self.state.forward_policy.as_ref(),
            forwarding.connect_timeout,
            &self.cancel,
        )
        .await
        {
            Ok(socket) => socket,
            Err(e) => {
                tracing::info!("Rejected direct-tcpip channel {}: {}", target, e);
                return Ok(false);
            }
        };

        let id = channel.id();
        let teardown = Teardown::new(&self.cancel);
        if let Err(refusal) = self.dispatcher.register_tunnel(id, teardown.clone()) {
            tracing::info!("Rejected direct-tcpip channel from {}: {}", self.peer_addr, refusal);
            return Ok(false);
        }

        let control = Arc::new(RusshChannel::new(session.handle(), id));
        let stats = Arc::clone(&self.state.stats);
        stats.channel_opened();
        tokio::spawn(async move {
            tunnel::run_tunnel(channel.into_stream(), socket, control, teardown).await;
            stats.channel_closed();
        });

        tracing::debug!("Tunnel channel {:?} opened to {}", id, target);
        Ok(true)
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.refuse_open("x11");
        Ok(false)
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.refuse_open("forwarded-tcpip");
        Ok(false)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let kind = RequestKind::PtyReq {
            term: term.to_string(),
            size: TerminalSize::from_wire(col_width, row_height),
        };
        self.route(channel, ChannelRequest::new(kind, true), session).await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let kind = RequestKind::WindowChange {
            size: TerminalSize::from_wire(col_width, row_height),
        };
        self.route(channel, ChannelRequest::new(kind, false), session).await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let kind = RequestKind::Shell {
            payload: Bytes::new(),
        };
        self.route(channel, ChannelRequest::new(kind, true), session).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match RequestKind::exec(data) {
            Ok(kind) => self.route(channel, ChannelRequest::new(kind, true), session).await,
            Err(e) => {
                tracing::info!("Declining exec on channel {:?}: {}", channel, e);
                let _ = session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let kind = RequestKind::Subsystem {
            name: name.to_string(),
        };
        self.route(channel, ChannelRequest::new(kind, true), session).await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let kind = RequestKind::Other {
            name: "env".to_string(),
        };
        self.route(channel, ChannelRequest::new(kind, false), session).await;
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let kind = RequestKind::Other {
            name: "x11-req".to_string(),
        };
        self.route(channel, ChannelRequest::new(kind, true), session).await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Ignoring signal {:?} on channel {:?}", signal, channel);
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::info!(
            "Declined tcpip-forward {}:{} from {}",
            address,
            port,
            self.peer_addr
        );
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!("Channel EOF: {:?}", channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel closed: {:?}", channel);
        self.dispatcher.close(channel);
        Ok(())
    }
}
