//! CLI command implementations

mod config;
mod passwd;

pub use config::{config_init, config_path, config_show, load_server_config};
pub use passwd::{passwd_check, passwd_init, passwd_list, passwd_set, PasswdTarget};
