//! Store file format
//!
//! UTF-8 text, one `username:salt:hash` record per line. Lines starting
//! with `#` and blank lines are skipped. There is no escaping, so no field
//! may contain `:` or a newline.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::PasswdError;

/// First line of every store file
pub const HEADER: &str = "#username:salt:hash";

const FIELDS: usize = 3;

/// One credential record; wiped when dropped
#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Record {
    pub username: String,
    pub salt: String,
    pub hash: String,
}

impl Record {
    pub fn new(username: impl Into<String>, salt: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            salt: salt.into(),
            hash: hash.into(),
        }
    }
}

/// Parse raw file bytes
pub fn parse_bytes(content: &[u8]) -> Result<Vec<Record>, PasswdError> {
    let text = std::str::from_utf8(content).map_err(|_| PasswdError::Encoding)?;
    parse(text)
}

/// Parse file text into records, in file order
pub fn parse(content: &str) -> Result<Vec<Record>, PasswdError> {
    let mut records = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != FIELDS {
            return Err(PasswdError::Malformed { line: idx + 1 });
        }

        records.push(Record::new(fields[0], fields[1], fields[2]));
    }

    Ok(records)
}

/// Render header plus records, newline terminated
pub fn render(records: &[Record]) -> String {
    let mut out = String::with_capacity(HEADER.len() + 1 + records.len() * 128);
    out.push_str(HEADER);
    out.push('\n');
    for record in records {
        out.push_str(&record.username);
        out.push(':');
        out.push_str(&record.salt);
        out.push(':');
        out.push_str(&record.hash);
        out.push('\n');
    }
    out
}

/// Reject names the format cannot hold
pub fn validate_username(username: &str) -> Result<(), PasswdError> {
    let representable = !username.is_empty()
        && !username.starts_with('#')
        && !username.contains([':', '\n', '\r'])
        && username.trim() == username;

    if representable {
        Ok(())
    } else {
        Err(PasswdError::InvalidUsername(username.to_string()))
    }
}
