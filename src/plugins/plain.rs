use super::{parse_frame, FrameworkPlugin};
use crate::models::{ExceptionInfo, LogEntry, LogLevel, StackFrame};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static LEVEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(fatal|critical|error|warn(?:ing)?|info|debug|trace)\b").unwrap());

/// Generic parser: JSON-lines records, otherwise a keyword scan for the level.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextPlugin;

impl FrameworkPlugin for PlainTextPlugin {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn parse_log(&self, process: &str, line: &str) -> LogEntry {
        let trimmed = line.trim();
        if trimmed.starts_with('{') {
            if let Ok(record @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
                return parse_json_record(process, line, &record);
            }
        }

        LogEntry::new(process, keyword_level(line).unwrap_or(LogLevel::Info), line)
            .with_message(trimmed)
    }
}

/// First level keyword found in `text`.
pub(crate) fn keyword_level(text: &str) -> Option<LogLevel> {
    LEVEL_RE
        .captures(text)
        .and_then(|caps| caps[1].parse().ok())
}

fn str_field<'a>(record: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| record.get(*key).and_then(Value::as_str))
}

fn parse_json_record(process: &str, line: &str, record: &Value) -> LogEntry {
    let level = str_field(record, &["level", "severity", "lvl"])
        .and_then(|l| l.parse().ok())
        .unwrap_or(LogLevel::Info);
    let message = str_field(record, &["message", "msg"]).unwrap_or(line.trim());

    let mut entry = LogEntry::new(process, level, line).with_message(message);
    if let Some(request_id) = str_field(record, &["request_id", "requestId"]) {
        entry = entry.with_request_id(request_id);
    }

    if let Some(exception) = record.get("exception").or_else(|| record.get("error")) {
        if let Some(info) = parse_json_exception(exception) {
            entry = entry.with_exception(info);
        }
    }
    entry
}

fn parse_json_exception(value: &Value) -> Option<ExceptionInfo> {
    let type_ = str_field(value, &["class", "type", "name"])?;
    let message = str_field(value, &["message", "msg"]).unwrap_or_default();

    let backtrace: Vec<StackFrame> = match value.get("backtrace").or_else(|| value.get("stack")) {
        Some(Value::Array(frames)) => frames
            .iter()
            .filter_map(Value::as_str)
            .filter_map(parse_frame)
            .collect(),
        Some(Value::String(stack)) => stack.lines().filter_map(parse_frame).collect(),
        _ => Vec::new(),
    };

    Some(ExceptionInfo {
        type_: type_.to_string(),
        message: message.to_string(),
        backtrace,
        fingerprint: None,
    })
}
