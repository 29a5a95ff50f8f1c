use super::plain::keyword_level;
use super::{parse_frame, FrameworkPlugin};
use crate::models::{ExceptionInfo, LogEntry, LogLevel, RequestInfo, StackFrame};
use once_cell::sync::Lazy;
use regex::Regex;

// I, [2024-05-01T10:00:00.123 #4242]  INFO -- : message
static LOGGER_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[DIWEFAU], \[[^\]]*\]\s+(DEBUG|INFO|WARN|ERROR|FATAL|ANY|UNKNOWN) -- [^:]*: ?(.*)$")
        .unwrap()
});
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[([^\]]+)\]\s*").unwrap());
static REQUEST_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}|[0-9a-fA-F-]{16,})$")
        .unwrap()
});
static STARTED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^Started (GET|POST|PUT|PATCH|DELETE|HEAD|OPTIONS) "([^"]+)""#).unwrap()
});
static PROCESSING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Processing by ([A-Z][\w:]*)#(\w+)").unwrap());
static COMPLETED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Completed (\d{3})").unwrap());
// NoMethodError (undefined method 'name' for nil):
static EXCEPTION_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z]\w*(?:::[A-Z]\w*)*) \((.*)\):\s*$").unwrap());
// app/models/user.rb:12:in 'name': undefined method 'x' for nil (NoMethodError)
static UNCAUGHT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^\s:]+):(\d+):in [`'](.+?)': (.*) \(([A-Z]\w*(?:::[A-Z]\w*)*)\)$").unwrap()
});

/// Parser for Rails development logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RailsPlugin;

impl FrameworkPlugin for RailsPlugin {
    fn name(&self) -> &'static str {
        "rails"
    }

    fn parse_log(&self, process: &str, line: &str) -> LogEntry {
        let (logger_level, mut body) = match LOGGER_PREFIX_RE.captures(line) {
            Some(caps) => (
                caps[1].parse::<LogLevel>().ok(),
                caps.get(2).map_or("", |m| m.as_str()),
            ),
            None => (None, line),
        };

        let mut request_id = None;
        while let Some(caps) = TAG_RE.captures(body) {
            let tag = &caps[1];
            if request_id.is_none() && REQUEST_ID_RE.is_match(tag) {
                request_id = Some(tag.to_string());
            }
            body = &body[caps[0].len()..];
        }
        let body = body.trim();

        let (level, request, exception) = classify(body);
        let level = match (logger_level, level) {
            (Some(LogLevel::Fatal), _) => LogLevel::Fatal,
            (_, Some(level)) => level,
            (Some(level), None) => level,
            (None, None) => keyword_level(body).unwrap_or(LogLevel::Info),
        };

        let mut entry = LogEntry::new(process, level, line).with_message(body);
        if let Some(request_id) = request_id {
            entry = entry.with_request_id(request_id);
        }
        if let Some(request) = request {
            entry = entry.with_request(request);
        }
        if let Some(exception) = exception {
            entry = entry.with_exception(exception);
        }
        entry
    }
}

/// Level implied by the line's content, plus any request or exception data.
fn classify(body: &str) -> (Option<LogLevel>, Option<RequestInfo>, Option<ExceptionInfo>) {
    if let Some(caps) = STARTED_RE.captures(body) {
        let request = RequestInfo {
            method: Some(caps[1].to_string()),
            path: Some(caps[2].to_string()),
            ..RequestInfo::default()
        };
        return (Some(LogLevel::Info), Some(request), None);
    }

    if let Some(caps) = PROCESSING_RE.captures(body) {
        let request = RequestInfo {
            controller: Some(caps[1].to_string()),
            action: Some(caps[2].to_string()),
            ..RequestInfo::default()
        };
        return (Some(LogLevel::Info), Some(request), None);
    }

    if let Some(caps) = COMPLETED_RE.captures(body) {
        let level = match caps[1].as_bytes()[0] {
            b'5' => LogLevel::Error,
            b'4' => LogLevel::Warning,
            _ => LogLevel::Info,
        };
        return (Some(level), None, None);
    }

    if let Some(caps) = EXCEPTION_HEADER_RE.captures(body) {
        let exception = ExceptionInfo {
            type_: caps[1].to_string(),
            message: caps[2].to_string(),
            backtrace: Vec::new(),
            fingerprint: None,
        };
        return (Some(LogLevel::Error), None, Some(exception));
    }

    if let Some(caps) = UNCAUGHT_RE.captures(body) {
        let frame = caps[2].parse().ok().map(|line| StackFrame {
            file: caps[1].to_string(),
            line,
            function: Some(caps[3].to_string()),
        });
        let exception = ExceptionInfo {
            type_: caps[5].to_string(),
            message: caps[4].to_string(),
            backtrace: frame.into_iter().collect(),
            fingerprint: None,
        };
        return (Some(LogLevel::Error), None, Some(exception));
    }

    if parse_frame(body).is_some() {
        return (Some(LogLevel::Error), None, None);
    }

    (None, None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST_ID: &str = "6f1c2b7e-9a34-4d2a-b8e1-0c5d9f3a7b21";

    fn parse(line: &str) -> LogEntry {
        RailsPlugin.parse_log("web", line)
    }

    #[test]
    fn extracts_request_start() {
        let entry = parse(&format!(
            "[{}] Started GET \"/users/42\" for 127.0.0.1 at 2024-05-01 10:00:00 +0000",
            REQUEST_ID
        ));
        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.request_id.as_deref(), Some(REQUEST_ID));
        let request = entry.request.unwrap();
        assert_eq!(request.method.as_deref(), Some("GET"));
        assert_eq!(request.path.as_deref(), Some("/users/42"));
        assert!(entry.message.starts_with("Started GET"));
    }

    #[test]
    fn extracts_controller_and_action() {
        let entry = parse(&format!(
            "[{}] Processing by Admin::UsersController#show as HTML",
            REQUEST_ID
        ));
        let request = entry.request.unwrap();
        assert_eq!(request.controller.as_deref(), Some("Admin::UsersController"));
        assert_eq!(request.action.as_deref(), Some("show"));
    }

    #[test]
    fn server_errors_are_errors() {
        assert_eq!(parse("Completed 500 Internal Server Error in 12ms").level, LogLevel::Error);
        assert_eq!(parse("Completed 404 Not Found in 3ms").level, LogLevel::Warning);
        assert_eq!(parse("Completed 200 OK in 8ms").level, LogLevel::Info);
    }

    #[test]
    fn exception_header_becomes_exception() {
        let entry = parse(&format!(
            "[{}] NoMethodError (undefined method 'name' for nil):",
            REQUEST_ID
        ));
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.request_id.as_deref(), Some(REQUEST_ID));
        let exception = entry.exception.unwrap();
        assert_eq!(exception.type_, "NoMethodError");
        assert_eq!(exception.message, "undefined method 'name' for nil");
    }

    #[test]
    fn namespaced_exception_header() {
        let entry = parse("ActionView::Template::Error (undefined local variable or method 'foo'):");
        assert_eq!(entry.exception.unwrap().type_, "ActionView::Template::Error");
    }

    #[test]
    fn uncaught_exception_carries_location() {
        let entry = parse("app/models/user.rb:12:in 'full_name': undefined method 'upcase' for nil (NoMethodError)");
        let exception = entry.exception.unwrap();
        assert_eq!(exception.type_, "NoMethodError");
        assert_eq!(exception.message, "undefined method 'upcase' for nil");
        assert_eq!(exception.backtrace[0].file, "app/models/user.rb");
        assert_eq!(exception.backtrace[0].line, 12);
    }

    #[test]
    fn backtrace_frames_are_error_lines() {
        let entry = parse("app/controllers/users_controller.rb:10:in 'show'");
        assert_eq!(entry.level, LogLevel::Error);
        assert!(entry.exception.is_none());
    }

    #[test]
    fn logger_prefix_sets_level_and_strips_header() {
        let entry = parse(&format!(
            "W, [2024-05-01T10:00:00.123456 #4242]  WARN -- : [{}] Cache miss for users/42",
            REQUEST_ID
        ));
        assert_eq!(entry.level, LogLevel::Warning);
        assert_eq!(entry.request_id.as_deref(), Some(REQUEST_ID));
        assert_eq!(entry.message, "Cache miss for users/42");
    }

    #[test]
    fn non_id_tags_are_skipped() {
        let entry = parse("[ActiveJob] [SyncJob] Performing SyncJob");
        assert_eq!(entry.request_id, None);
        assert_eq!(entry.message, "Performing SyncJob");
        assert_eq!(entry.level, LogLevel::Info);
    }
}
