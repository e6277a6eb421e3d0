//! Capabilities a verification call needs from the outside world
//!
//! Verification never touches the filesystem or the account database
//! directly; it goes through an [`AuthContext`] built once at startup, so
//! tests can substitute both.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::error::PasswdError;

/// Reads a named resource into a buffer that is wiped on drop
pub trait ResourceReader: Send + Sync {
    fn read(&self, path: &Path) -> std::io::Result<Zeroizing<Vec<u8>>>;
}

/// Resolves a system account by name
pub trait AccountResolver: Send + Sync {
    /// `Ok(None)` means the account does not exist
    fn lookup(&self, name: &str) -> Result<Option<SystemAccount>, PasswdError>;
}

/// The parts of a system account the server uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemAccount {
    pub name: String,
    pub uid: u32,
    pub home: PathBuf,
    pub shell: PathBuf,
}

/// Bundle of the two capabilities
#[derive(Clone)]
pub struct AuthContext {
    reader: Arc<dyn ResourceReader>,
    accounts: Arc<dyn AccountResolver>,
}

impl AuthContext {
    pub fn new(reader: Arc<dyn ResourceReader>, accounts: Arc<dyn AccountResolver>) -> Self {
        Self { reader, accounts }
    }

    /// Context backed by the real filesystem and account database
    pub fn system() -> Self {
        Self::new(Arc::new(FsReader), Arc::new(NixAccounts))
    }

    pub fn reader(&self) -> &dyn ResourceReader {
        self.reader.as_ref()
    }

    pub fn accounts(&self) -> &dyn AccountResolver {
        self.accounts.as_ref()
    }
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext").finish_non_exhaustive()
    }
}

/// Reads from the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FsReader;

impl ResourceReader for FsReader {
    fn read(&self, path: &Path) -> std::io::Result<Zeroizing<Vec<u8>>> {
        std::fs::read(path).map(Zeroizing::new)
    }
}

/// Resolves accounts through `getpwnam_r`
#[derive(Debug, Clone, Copy, Default)]
pub struct NixAccounts;

impl AccountResolver for NixAccounts {
    fn lookup(&self, name: &str) -> Result<Option<SystemAccount>, PasswdError> {
        let user = nix::unistd::User::from_name(name)
            .map_err(|e| PasswdError::Account(e.to_string()))?;

        Ok(user.map(|u| SystemAccount {
            name: u.name,
            uid: u.uid.as_raw(),
            home: u.dir,
            shell: u.shell,
        }))
    }
}
