use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

// CSI sequences, OSC sequences terminated by BEL or ST, and lone two-byte escapes.
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("valid ANSI escape pattern")
});

/// Removes terminal control sequences so PTY output can be parsed as text.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    if !text.contains('\x1b') {
        return Cow::Borrowed(text);
    }
    ANSI_ESCAPE.replace_all(text, "")
}
