use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Raw, unsplit output from a pseudo-terminal. Carries control sequences and
/// prompt redraws untouched for console-style consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalChunk {
    pub process: String,
    pub data: Vec<u8>,
}
