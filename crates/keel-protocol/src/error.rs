//! Protocol error types

use thiserror::Error;

/// Errors for channel fields the server will not act on
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A text field was not valid UTF-8
    #[error("Field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    /// A port number outside the TCP range
    #[error("Port {0} is out of range")]
    InvalidPort(u32),
}
