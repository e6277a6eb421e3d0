//! Credential store error types

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by the credential store and the shadow verifier
#[derive(Error, Debug)]
pub enum PasswdError {
    /// Reading or writing a credential file failed
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A data row did not have exactly three fields
    #[error("Malformed record on line {line}")]
    Malformed { line: usize },

    /// The file is not valid UTF-8
    #[error("Credential file is not valid UTF-8")]
    Encoding,

    /// The username cannot be stored in the record format
    #[error("Invalid username: {0:?}")]
    InvalidUsername(String),

    /// Cost parameters rejected by the hash function
    #[error("Invalid hash policy: {0}")]
    Policy(String),

    /// Hashing or hash parsing failed
    #[error("Hash error: {0}")]
    Hash(String),

    /// System account lookup failed (not the same as "no such account")
    #[error("Account lookup failed: {0}")]
    Account(String),

    /// No shadow database on this platform
    #[error("System password database is not supported on this platform")]
    Unsupported,
}

impl PasswdError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
