//! keel-passwd: credential storage for keel
//!
//! Two verification paths share one discipline: a lookup for a name that is
//! not present does the same hashing work as a wrong password and reports
//! the same `Ok(false)`.
//!
//! - [`LocalStore`]: the `username:salt:hash` file managed by `keel passwd`
//! - [`ShadowVerifier`]: the operating system's shadow database

pub mod context;
pub mod error;
pub mod hash;
pub mod local;
pub mod record;
pub mod shadow;

pub use context::{AccountResolver, AuthContext, FsReader, NixAccounts, ResourceReader, SystemAccount};
pub use error::PasswdError;
pub use hash::{Argon2Hasher, CredentialHasher, HashCost, HashPolicy};
pub use local::LocalStore;
pub use record::{Record, HEADER};
pub use shadow::ShadowVerifier;
