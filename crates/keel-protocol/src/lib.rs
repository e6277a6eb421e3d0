//! keel-protocol: channel-level protocol types for keel
//!
//! This crate defines what the server core understands about a channel:
//! its kind, the requests that can arrive on it, and the validation applied
//! to the fields a transport hands over.

pub mod channel;
pub mod error;
pub mod request;
pub mod terminal;

pub use channel::{ChannelKind, ForwardTarget};
pub use error::ProtocolError;
pub use request::{ChannelRequest, RequestKind, SFTP_SUBSYSTEM};
pub use terminal::TerminalSize;
