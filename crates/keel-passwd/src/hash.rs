//! Password hashing policy
//!
//! A [`HashPolicy`] is built once at process start and shared by every
//! verification. It owns the hasher and a dummy record hashed at the same
//! cost, which stands in for usernames that are not in the store.

use std::fmt;
use std::sync::Arc;

use argon2::password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::PasswdError;
use crate::record::Record;

/// Salt length in bytes before base64 encoding
pub const SALT_LEN: usize = 16;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashCost {
    /// Memory in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Lanes
    pub parallelism: u32,
}

impl Default for HashCost {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

/// Turns a secret and a salt into a stored hash, and checks one
pub trait CredentialHasher: Send + Sync {
    /// Hash `secret` with the base64 `salt`
    fn hash(&self, secret: &[u8], salt: &str) -> Result<String, PasswdError>;

    /// Check `secret` against a stored `hash` produced with `salt`
    ///
    /// A mismatch is `Ok(false)`; only unusable input is an error.
    fn verify(&self, secret: &[u8], salt: &str, hash: &str) -> Result<bool, PasswdError>;
}

/// Argon2id in PHC string format
pub struct Argon2Hasher {
    params: Params,
}

impl Argon2Hasher {
    pub fn new(cost: HashCost) -> Result<Self, PasswdError> {
        let params = Params::new(cost.memory_kib, cost.iterations, cost.parallelism, None)
            .map_err(|e| PasswdError::Policy(e.to_string()))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl CredentialHasher for Argon2Hasher {
    fn hash(&self, secret: &[u8], salt: &str) -> Result<String, PasswdError> {
        let salt = SaltString::from_b64(salt).map_err(|e| PasswdError::Hash(e.to_string()))?;
        let hash = self
            .argon2()
            .hash_password(secret, &salt)
            .map_err(|e| PasswdError::Hash(e.to_string()))?;
        Ok(hash.to_string())
    }

    fn verify(&self, secret: &[u8], salt: &str, hash: &str) -> Result<bool, PasswdError> {
        let parsed = PasswordHash::new(hash).map_err(|e| PasswdError::Hash(e.to_string()))?;
        let salt_matches = parsed.salt.map(|s| s.as_str() == salt).unwrap_or(false);

        match self.argon2().verify_password(secret, &parsed) {
            Ok(()) => Ok(salt_matches),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(PasswdError::Hash(e.to_string())),
        }
    }
}

impl fmt::Debug for Argon2Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Argon2Hasher")
            .field("m_cost", &self.params.m_cost())
            .field("t_cost", &self.params.t_cost())
            .field("p_cost", &self.params.p_cost())
            .finish()
    }
}

/// Hasher plus the dummy record used for absent usernames
#[derive(Clone)]
pub struct HashPolicy {
    hasher: Arc<dyn CredentialHasher>,
    dummy: Arc<Record>,
}

impl HashPolicy {
    /// Argon2id at the given cost
    pub fn new(cost: HashCost) -> Result<Self, PasswdError> {
        Self::with_hasher(Arc::new(Argon2Hasher::new(cost)?))
    }

    /// Build around any hasher; the dummy record is hashed with it here
    pub fn with_hasher(hasher: Arc<dyn CredentialHasher>) -> Result<Self, PasswdError> {
        let mut throwaway = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut throwaway[..]);

        let salt = generate_salt()?;
        let hash = hasher.hash(&throwaway[..], &salt)?;
        let dummy = Arc::new(Record::new("", salt, hash));

        Ok(Self { hasher, dummy })
    }

    pub fn hasher(&self) -> &dyn CredentialHasher {
        self.hasher.as_ref()
    }

    /// Record substituted when the username is not found
    pub fn dummy(&self) -> &Record {
        &self.dummy
    }

    /// Fresh salt and hash for a new secret
    pub fn seal(&self, secret: &[u8]) -> Result<(String, String), PasswdError> {
        let salt = generate_salt()?;
        let hash = self.hasher.hash(secret, &salt)?;
        Ok((salt, hash))
    }
}

impl fmt::Debug for HashPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashPolicy").finish_non_exhaustive()
    }
}

/// Random base64 salt from the OS generator
pub fn generate_salt() -> Result<String, PasswdError> {
    let mut raw = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut raw);
    let salt = SaltString::encode_b64(&raw).map_err(|e| PasswdError::Hash(e.to_string()))?;
    Ok(salt.as_str().to_string())
}
