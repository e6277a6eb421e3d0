//! SSH server implementation

mod control;
pub mod dispatch;
mod handler;
mod listener;

pub use control::RusshChannel;
pub use handler::ConnectionHandler;
pub use listener::{load_or_generate_host_key, SshServer};
