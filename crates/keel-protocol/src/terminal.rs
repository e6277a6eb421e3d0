//! Terminal dimensions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Default terminal size (24x80)
    pub fn default_size() -> Self {
        Self { rows: 24, cols: 80 }
    }

    /// Build from the `uint32` width/height pair carried by pty-req and
    /// window-change. Values past `u16::MAX` are clamped.
    pub fn from_wire(cols: u32, rows: u32) -> Self {
        let clamp = |v: u32| v.min(u16::MAX as u32) as u16;
        Self {
            rows: clamp(rows),
            cols: clamp(cols),
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::default_size()
    }
}

impl fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}
