//! Local credential store

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

use crate::context::AuthContext;
use crate::error::PasswdError;
use crate::hash::HashPolicy;
use crate::record::{self, Record};

/// The `username:salt:hash` file
///
/// Nothing is cached: every [`verify`](Self::verify) re-reads the file.
/// Writers hold an exclusive lock on `<store>.lock` for the whole
/// read-modify-write and replace the file with a single rename, so readers
/// never lock and never see a partial file.
#[derive(Debug, Clone)]
pub struct LocalStore {
    path: PathBuf,
    policy: HashPolicy,
}

impl LocalStore {
    pub fn new(path: impl Into<PathBuf>, policy: HashPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check `secret` for `username`
    ///
    /// An absent username is checked against the policy's dummy record, so
    /// it costs one hash verification exactly like a wrong password, and
    /// both report `Ok(false)`. With `sysacct_check` the system account is
    /// looked up on every call and a missing account forces `false`.
    pub fn verify(
        &self,
        ctx: &AuthContext,
        username: &str,
        secret: &[u8],
        sysacct_check: bool,
    ) -> Result<bool, PasswdError> {
        let content = ctx
            .reader()
            .read(&self.path)
            .map_err(|e| PasswdError::io(&self.path, e))?;
        let records = record::parse_bytes(&content)?;
        drop(content);

        let found = records.iter().find(|r| r.username == username);
        let candidate = found.unwrap_or_else(|| self.policy.dummy());
        let matched = self
            .policy
            .hasher()
            .verify(secret, &candidate.salt, &candidate.hash)?;
        let mut valid = found.is_some() & matched;

        if sysacct_check {
            let account = ctx.accounts().lookup(username)?;
            valid &= account.is_some();
        }

        Ok(valid)
    }

    /// Set or replace the secret for `username`
    ///
    /// A missing store file is treated as empty.
    pub fn set_password(&self, username: &str, secret: &[u8]) -> Result<(), PasswdError> {
        record::validate_username(username)?;

        let _lock = self.lock()?;
        let mut records = self.read_existing()?;
        let (salt, hash) = self.policy.seal(secret)?;

        let updated = Record::new(username, salt, hash);
        match records.iter_mut().find(|r| r.username == username) {
            // the replaced record is wiped as it drops
            Some(existing) => *existing = updated,
            None => records.push(updated),
        }

        self.replace(&records)?;
        tracing::debug!(path = %self.path.display(), "Credential store updated");
        Ok(())
    }

    /// Create a header-only store if none exists; `true` if one was created
    pub fn init(&self) -> Result<bool, PasswdError> {
        let _lock = self.lock()?;
        if self.path.exists() {
            return Ok(false);
        }
        self.replace(&[])?;
        Ok(true)
    }

    /// Usernames in file order
    pub fn usernames(&self) -> Result<Vec<String>, PasswdError> {
        let content = Zeroizing::new(fs::read(&self.path).map_err(|e| PasswdError::io(&self.path, e))?);
        Ok(record::parse_bytes(&content)?
            .iter()
            .map(|r| r.username.clone())
            .collect())
    }

    fn read_existing(&self) -> Result<Vec<Record>, PasswdError> {
        match fs::read(&self.path) {
            Ok(bytes) => record::parse_bytes(&Zeroizing::new(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(PasswdError::io(&self.path, e)),
        }
    }

    /// Write all records to a sibling temp file and rename it over the store
    fn replace(&self, records: &[Record]) -> Result<(), PasswdError> {
        let dir = self.dir();
        fs::create_dir_all(&dir).map_err(|e| PasswdError::io(&dir, e))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| PasswdError::io(&dir, e))?;
        let body = Zeroizing::new(record::render(records));
        tmp.write_all(body.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| PasswdError::io(tmp.path(), e))?;

        tmp.persist(&self.path)
            .map_err(|e| PasswdError::io(&self.path, e.error))?;
        Ok(())
    }

    fn lock(&self) -> Result<Flock<File>, PasswdError> {
        let path = self.lock_path();
        let dir = self.dir();
        fs::create_dir_all(&dir).map_err(|e| PasswdError::io(&dir, e))?;

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| PasswdError::io(&path, e))?;

        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| PasswdError::io(&path, std::io::Error::from(errno)))
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashCost;

    fn store_in(dir: &Path) -> LocalStore {
        let policy = HashPolicy::new(HashCost {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        })
        .unwrap();
        LocalStore::new(dir.join("passwd"), policy)
    }

    #[test]
    fn test_init_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        assert!(store.init().unwrap());
        assert!(!store.init().unwrap());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "#username:salt:hash\n");
    }

    #[test]
    fn test_set_password_creates_missing_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir.path().join("nested"));

        store.set_password("alice", b"secret").unwrap();

        let text = fs::read_to_string(store.path()).unwrap();
        assert!(text.starts_with("#username:salt:hash\n"));
        assert_eq!(store.usernames().unwrap(), vec!["alice".to_string()]);
    }

    #[test]
    fn test_set_password_rejects_empty_username() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        assert!(matches!(
            store.set_password("", b"secret"),
            Err(PasswdError::InvalidUsername(_))
        ));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_update_keeps_position() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        for name in ["alice", "bob", "carol"] {
            store.set_password(name, b"first").unwrap();
        }
        store.set_password("bob", b"second").unwrap();

        assert_eq!(store.usernames().unwrap(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.set_password("alice", b"secret").unwrap();

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["passwd", "passwd.lock"]);
    }

    #[test]
    fn test_verify_malformed_store_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(store.path(), "#username:salt:hash\nalice:only-two\n").unwrap();

        let err = store
            .verify(&AuthContext::system(), "alice", b"secret", false)
            .unwrap_err();
        assert!(matches!(err, PasswdError::Malformed { line: 2 }));
    }

    #[test]
    fn test_verify_missing_store_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let err = store
            .verify(&AuthContext::system(), "alice", b"secret", false)
            .unwrap_err();
        assert!(matches!(err, PasswdError::Io { .. }));
    }
}
