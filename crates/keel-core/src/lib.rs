//! keel-core: configuration and error types for keel
//!
//! Shared by the `keeld` server and the `keel` operator CLI.

pub mod config;
pub mod error;

pub use config::ServerConfig;
pub use error::{ConfigError, KeelError};
