//! Channel requests
//!
//! A session channel receives a small set of out-of-band requests
//! (RFC 4254 §6). The transport parses them; this module only checks the
//! fields the server acts on.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::terminal::TerminalSize;

/// The only subsystem the server recognizes
pub const SFTP_SUBSYSTEM: &str = "sftp";

/// A request received on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// What is being asked for
    pub kind: RequestKind,
    /// Whether the peer waits for a success/failure reply
    pub want_reply: bool,
}

/// Request kinds the session state machine distinguishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// `pty-req`: allocate (or re-size) a pseudo-terminal
    PtyReq { term: String, size: TerminalSize },
    /// `window-change`: the client terminal was resized
    WindowChange { size: TerminalSize },
    /// `shell`: start the login shell; a bare request has no payload
    Shell { payload: Bytes },
    /// `exec`: run one command through the shell
    Exec { command: String },
    /// `subsystem`: start a named subsystem
    Subsystem { name: String },
    /// Anything else, kept by name so it can be declined and logged
    Other { name: String },
}

impl RequestKind {
    /// `exec` with its command bytes, which must be UTF-8
    pub fn exec(command: &[u8]) -> Result<Self, ProtocolError> {
        let command = std::str::from_utf8(command)
            .map_err(|_| ProtocolError::InvalidUtf8 { field: "command" })?;
        Ok(Self::Exec {
            command: command.to_string(),
        })
    }

    /// Wire name of the request
    pub fn name(&self) -> &str {
        match self {
            Self::PtyReq { .. } => "pty-req",
            Self::WindowChange { .. } => "window-change",
            Self::Shell { .. } => "shell",
            Self::Exec { .. } => "exec",
            Self::Subsystem { .. } => "subsystem",
            Self::Other { name } => name,
        }
    }
}

impl ChannelRequest {
    /// Create a request
    pub fn new(kind: RequestKind, want_reply: bool) -> Self {
        Self { kind, want_reply }
    }
}
