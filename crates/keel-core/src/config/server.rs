//! Server configuration

use keel_passwd::{Argon2Hasher, HashCost};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

const FALLBACK_SHELL: &str = "/bin/sh";

/// Configuration for the `keeld` daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the SSH server to
    pub bind_address: String,

    /// Path to the host key file (generated on first start)
    pub host_key_path: PathBuf,

    /// Login shell for `shell` and `exec`; `$SHELL` or `/bin/sh` when unset
    pub shell: Option<PathBuf>,

    /// Program serving the `sftp` subsystem over stdin/stdout
    pub sftp_server: PathBuf,

    /// Channels a single connection may hold open at once
    pub max_channels_per_connection: Option<usize>,

    /// Password authentication
    pub auth: AuthConfig,

    /// direct-tcpip forwarding
    pub forwarding: ForwardingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            bind_address: "0.0.0.0:2222".to_string(),
            host_key_path: config_dir.join("host_key"),
            shell: None,
            sftp_server: PathBuf::from("/usr/lib/openssh/sftp-server"),
            max_channels_per_connection: None,
            auth: AuthConfig::default(),
            forwarding: ForwardingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Shell to spawn: configured, else `$SHELL`, else `/bin/sh`
    pub fn resolve_shell(&self) -> PathBuf {
        self.shell
            .clone()
            .or_else(|| std::env::var_os("SHELL").filter(|s| !s.is_empty()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(FALLBACK_SHELL))
    }

    /// Check values that would otherwise only fail once the server is up
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_address.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!("bind_address {:?}: {}", self.bind_address, e))
        })?;

        if self.max_channels_per_connection == Some(0) {
            return Err(ConfigError::Invalid(
                "max_channels_per_connection must be at least 1".to_string(),
            ));
        }

        Argon2Hasher::new(self.auth.hash.cost())
            .map_err(|e| ConfigError::Invalid(format!("auth.hash: {}", e)))?;

        Ok(())
    }
}

/// Which credential database password authentication uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthBackend {
    /// The `username:salt:hash` store managed by `keel passwd`
    #[default]
    Local,
    /// The operating system's shadow database
    System,
}

/// Password authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub backend: AuthBackend,

    /// Local store location
    pub password_file: PathBuf,

    /// Also require a matching system account (local backend)
    pub system_account_check: bool,

    /// Argon2id cost for new and dummy hashes
    pub hash: HashConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            backend: AuthBackend::Local,
            password_file: super::default_config_dir().join("passwd"),
            system_account_check: false,
            hash: HashConfig::default(),
        }
    }
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashConfig {
    fn default() -> Self {
        let cost = HashCost::default();
        Self {
            memory_kib: cost.memory_kib,
            iterations: cost.iterations,
            parallelism: cost.parallelism,
        }
    }
}

impl HashConfig {
    pub fn cost(&self) -> HashCost {
        HashCost {
            memory_kib: self.memory_kib,
            iterations: self.iterations,
            parallelism: self.parallelism,
        }
    }
}

/// direct-tcpip forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Accept direct-tcpip channels at all
    pub enabled: bool,

    /// Destination hosts permitted; every host when unset
    pub allowed_hosts: Option<Vec<String>>,

    /// Dial timeout in seconds
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_hosts: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}
