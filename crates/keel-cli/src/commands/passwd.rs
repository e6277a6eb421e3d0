//! Password store commands

use std::path::PathBuf;

use anyhow::{Context, Result};
use keel_core::config::AuthBackend;
use keel_core::ServerConfig;
use keel_passwd::{AuthContext, HashPolicy, LocalStore};

use crate::output::{print_info, print_success, print_warning};
use crate::secret::read_password;

/// Which store a command operates on
pub struct PasswdTarget {
    pub store: LocalStore,
    pub system_account_check: bool,
}

impl PasswdTarget {
    /// The configured store, or `file` when given
    pub fn resolve(config: &ServerConfig, file: Option<PathBuf>) -> Result<Self> {
        if config.auth.backend == AuthBackend::System {
            print_warning("keeld is configured for system accounts; this store is not used");
        }

        let policy = HashPolicy::new(config.auth.hash.cost()).context("Invalid [auth.hash] cost")?;
        let path = file.unwrap_or_else(|| config.auth.password_file.clone());
        Ok(Self {
            store: LocalStore::new(path, policy),
            system_account_check: config.auth.system_account_check,
        })
    }
}

pub fn passwd_init(target: &PasswdTarget) -> Result<()> {
    let path = target.store.path();
    if target.store.init()? {
        print_success(&format!("Created password store: {:?}", path));
    } else {
        print_info(&format!("Password store already exists: {:?}", path));
    }
    Ok(())
}

/// Set or replace a user's password
pub fn passwd_set(target: &PasswdTarget, username: &str) -> Result<()> {
    let password = read_password(&format!("New password for {}: ", username))?;
    if password.is_empty() {
        anyhow::bail!("Refusing to set an empty password");
    }

    if std::io::IsTerminal::is_terminal(&std::io::stdin()) {
        let confirm = read_password("Retype password: ")?;
        if *confirm != *password {
            anyhow::bail!("Passwords do not match");
        }
    }

    target
        .store
        .set_password(username, password.as_bytes())
        .with_context(|| format!("Failed to set password for {}", username))?;

    print_success(&format!("Password set for {}", username));
    Ok(())
}

/// Verify a password the way keeld would; `false` on mismatch
pub fn passwd_check(target: &PasswdTarget, username: &str) -> Result<bool> {
    let password = read_password(&format!("Password for {}: ", username))?;
    let ctx = AuthContext::system();

    let valid = target
        .store
        .verify(&ctx, username, password.as_bytes(), target.system_account_check)
        .context("Failed to verify password")?;

    if valid {
        print_success("Password accepted");
    } else {
        crate::output::print_error("Password rejected");
    }
    Ok(valid)
}

pub fn passwd_list(target: &PasswdTarget) -> Result<()> {
    let users = target.store.usernames()?;
    if users.is_empty() {
        print_info("No users in password store");
        return Ok(());
    }
    for user in users {
        println!("{}", user);
    }
    Ok(())
}
