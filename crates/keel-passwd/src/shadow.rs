//! Verification against the operating system's shadow database

use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::context::AuthContext;
use crate::error::PasswdError;

#[cfg(target_os = "linux")]
const SYSTEM_SHADOW: Option<&str> = Some("/etc/shadow");
#[cfg(target_os = "freebsd")]
const SYSTEM_SHADOW: Option<&str> = Some("/etc/master.passwd");
#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
const SYSTEM_SHADOW: Option<&str> = None;

/// Checks secrets against crypt(3) hashes in a shadow-format file
///
/// Both `/etc/shadow` and FreeBSD's `master.passwd` keep the name in the
/// first field and the hash in the second.
#[derive(Debug, Clone)]
pub struct ShadowVerifier {
    path: PathBuf,
    dummy: String,
}

impl ShadowVerifier {
    /// Verifier for this platform's shadow file
    pub fn system() -> Result<Self, PasswdError> {
        let path = SYSTEM_SHADOW.ok_or(PasswdError::Unsupported)?;
        Self::new(path)
    }

    /// Verifier for a shadow-format file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, PasswdError> {
        let throwaway: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        let dummy = pwhash::sha512_crypt::hash(throwaway).map_err(|e| PasswdError::Hash(e.to_string()))?;

        Ok(Self {
            path: path.into(),
            dummy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check `secret` for `username`
    ///
    /// Absent, locked and password-less entries are checked against a
    /// dummy SHA-512-crypt hash and report `Ok(false)`.
    pub fn verify(&self, ctx: &AuthContext, username: &str, secret: &[u8]) -> Result<bool, PasswdError> {
        let content = ctx
            .reader()
            .read(&self.path)
            .map_err(|e| PasswdError::io(&self.path, e))?;
        let text = std::str::from_utf8(&content).map_err(|_| PasswdError::Encoding)?;

        let entry = text
            .lines()
            .filter(|line| !line.starts_with('#'))
            .filter_map(|line| {
                let mut fields = line.splitn(3, ':');
                let name = fields.next()?;
                let hash = fields.next()?;
                Some((name, hash))
            })
            .find(|(name, _)| *name == username)
            .map(|(_, hash)| hash)
            .filter(|hash| usable(hash));

        match entry {
            Some(hash) => Ok(pwhash::unix::verify(secret, hash)),
            None => {
                let _ = pwhash::unix::verify(secret, &self.dummy);
                Ok(false)
            }
        }
    }
}

/// Empty, `!`-locked and `*` entries never authenticate
fn usable(hash: &str) -> bool {
    !hash.is_empty() && !hash.starts_with('!') && !hash.starts_with('*')
}
