use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// Deduplicated view of every occurrence sharing one fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub fingerprint: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub message: String,
    pub severity: Severity,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub stack_trace: String,
    /// Captured from the first occurrence only.
    pub context: BTreeMap<String, String>,
    pub resolved: bool,
    pub ignored: bool,
}

impl ExceptionRecord {
    pub fn is_active(&self) -> bool {
        !self.resolved && !self.ignored
    }
}
