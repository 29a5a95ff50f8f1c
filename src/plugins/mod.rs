//! Framework plugins turn raw output lines into structured log entries.

pub mod plain;
pub mod rails;

pub use plain::PlainTextPlugin;
pub use rails::RailsPlugin;

use crate::error::{Result, SupervisorError};
use crate::models::{LogEntry, StackFrame};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

/// Parses one line of process output.
///
/// Implementations are pure: the same line always yields the same entry, and
/// no state is carried between calls.
pub trait FrameworkPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse_log(&self, process: &str, line: &str) -> LogEntry;
}

/// Looks up a shipped plugin by its configuration name.
pub fn plugin_for(name: &str) -> Result<Arc<dyn FrameworkPlugin>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "" | "plain" | "text" => Ok(Arc::new(PlainTextPlugin)),
        "rails" | "ruby" => Ok(Arc::new(RailsPlugin)),
        other => Err(SupervisorError::Config(format!(
            "unknown framework plugin: {}",
            other
        ))),
    }
}

// path/to/file.rb:42:in 'method'  (also `method' and "from " prefixes)
static FRAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*(?:from\s+)?([^\s:'"`]+):(\d+)(?::in [`'](.+?)')?\s*$"#).unwrap()
});

/// Parses a single backtrace line.
pub fn parse_frame(line: &str) -> Option<StackFrame> {
    let caps = FRAME_RE.captures(line)?;
    Some(StackFrame {
        file: caps[1].to_string(),
        line: caps[2].parse().ok()?,
        function: caps.get(3).map(|m| m.as_str().to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ruby_frames() {
        let frame = parse_frame("app/models/user.rb:12:in 'full_name'").unwrap();
        assert_eq!(frame.file, "app/models/user.rb");
        assert_eq!(frame.line, 12);
        assert_eq!(frame.function.as_deref(), Some("full_name"));

        let frame = parse_frame("  from lib/tasks/seed.rb:3:in `block in <main>'").unwrap();
        assert_eq!(frame.function.as_deref(), Some("block in <main>"));

        let frame = parse_frame("src/index.js:7").unwrap();
        assert_eq!(frame.function, None);
    }

    #[test]
    fn rejects_non_frames() {
        assert!(parse_frame("Listening on http://127.0.0.1:3000").is_none());
        assert!(parse_frame("just some text").is_none());
    }

    #[test]
    fn looks_up_plugins_by_name() {
        assert_eq!(plugin_for("rails").unwrap().name(), "rails");
        assert_eq!(plugin_for("Plain").unwrap().name(), "plain");
        assert!(matches!(plugin_for("cobol"), Err(SupervisorError::Config(_))));
    }
}
