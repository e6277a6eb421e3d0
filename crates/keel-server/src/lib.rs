//! keel-server: password-authenticated SSH server
//!
//! Each accepted connection is driven by russh through a
//! [`server::ConnectionHandler`], which fans channels out to independent
//! tasks: a [`session::SessionHandler`] per `session` channel and a tunnel
//! per `direct-tcpip` channel. Both tear down exactly once through a
//! [`bridge::Teardown`].

pub mod auth;
pub mod bridge;
pub mod channel;
pub mod server;
pub mod session;
pub mod state;
pub mod tunnel;

pub use state::{ServerState, ServerStats};
