//! keel-cli: operator commands for a keel server
//!
//! Manages the local password store and the server configuration file.

pub mod commands;
pub mod output;
pub mod secret;
