//! Reading passwords without echo

use std::io::{BufRead, IsTerminal, Write};

use anyhow::{Context, Result};
use zeroize::Zeroizing;

/// Read one password: from the terminal with echo off, else the first stdin line
pub fn read_password(prompt: &str) -> Result<Zeroizing<String>> {
    if std::io::stdin().is_terminal() {
        read_from_terminal(prompt)
    } else {
        read_line(std::io::stdin().lock())
    }
}

/// First line of `input` with its line ending removed
pub fn read_line(mut input: impl BufRead) -> Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    input
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;

    let trimmed = line.trim_end_matches(['\n', '\r']).len();
    line.truncate(trimmed);
    Ok(line)
}

fn read_from_terminal(prompt: &str) -> Result<Zeroizing<String>> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{}", prompt)?;
    stderr.flush()?;

    let secret = rpassword::read_password().context("Failed to read password from terminal")?;
    Ok(Zeroizing::new(secret))
}
