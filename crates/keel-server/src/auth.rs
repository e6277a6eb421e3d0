//! Password authentication backends
//!
//! Verification hashes and reads files, so it runs on the blocking pool and
//! never on the connection's task.

use std::sync::Arc;

use keel_core::config::{AuthBackend, AuthConfig};
use keel_core::KeelError;
use keel_passwd::{AuthContext, HashPolicy, LocalStore, PasswdError, ShadowVerifier, SystemAccount};
use zeroize::Zeroizing;

/// Which database a password is checked against
#[derive(Debug)]
pub enum Backend {
    /// The keel store, optionally cross-checked against system accounts
    Local { store: LocalStore, sysacct_check: bool },
    /// The operating system's shadow database
    System(ShadowVerifier),
}

/// Verifies passwords presented during the SSH handshake
#[derive(Debug)]
pub struct PasswordAuthenticator {
    backend: Backend,
    ctx: AuthContext,
}

impl PasswordAuthenticator {
    pub fn new(backend: Backend, ctx: AuthContext) -> Self {
        Self { backend, ctx }
    }

    /// Build the configured backend; the hash policy is built here, once
    pub fn from_config(config: &AuthConfig, ctx: AuthContext) -> Result<Self, KeelError> {
        let backend = match config.backend {
            AuthBackend::Local => {
                let policy = HashPolicy::new(config.hash.cost())?;
                Backend::Local {
                    store: LocalStore::new(&config.password_file, policy),
                    sysacct_check: config.system_account_check,
                }
            }
            AuthBackend::System => Backend::System(ShadowVerifier::system()?),
        };
        Ok(Self::new(backend, ctx))
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Synchronous check
    pub fn check(&self, username: &str, secret: &[u8]) -> Result<bool, PasswdError> {
        match &self.backend {
            Backend::Local {
                store,
                sysacct_check,
            } => store.verify(&self.ctx, username, secret, *sysacct_check),
            Backend::System(verifier) => verifier.verify(&self.ctx, username, secret),
        }
    }

    /// Check on the blocking pool; every failure reports `false`
    pub async fn authenticate(self: &Arc<Self>, username: &str, password: Zeroizing<String>) -> bool {
        let this = Arc::clone(self);
        let user = username.to_string();

        let result = tokio::task::spawn_blocking(move || this.check(&user, password.as_bytes())).await;

        match result {
            Ok(Ok(valid)) => valid,
            Ok(Err(e)) => {
                tracing::error!("Credential check failed: {}", e);
                false
            }
            Err(e) => {
                tracing::error!("Credential check task failed: {}", e);
                false
            }
        }
    }

    /// Look up the system account for an authenticated user
    pub async fn account(self: &Arc<Self>, username: &str) -> Option<SystemAccount> {
        let this = Arc::clone(self);
        let user = username.to_string();

        match tokio::task::spawn_blocking(move || this.ctx.accounts().lookup(&user)).await {
            Ok(Ok(account)) => account,
            Ok(Err(e)) => {
                tracing::warn!("Account lookup failed: {}", e);
                None
            }
            Err(e) => {
                tracing::warn!("Account lookup task failed: {}", e);
                None
            }
        }
    }
}
