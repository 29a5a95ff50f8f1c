use crate::error::{Result, SupervisorError};
use crate::models::{ExceptionInfo, ExceptionRecord, LogEntry, LogLevel, Severity};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

pub const DEFAULT_EXCEPTION_CAPACITY: usize = 1000;

/// Stable identity for an exception without a caller-supplied fingerprint.
pub fn fingerprint(type_: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(type_.as_bytes());
    hasher.update(b":");
    hasher.update(message.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

fn fingerprint_of(exception: &ExceptionInfo) -> String {
    match exception.fingerprint.as_deref() {
        Some(fp) if !fp.is_empty() => fp.to_string(),
        _ => fingerprint(&exception.type_, &exception.message),
    }
}

/// Deduplicated index of exceptions seen in the log stream.
pub struct ExceptionTracker {
    records: RwLock<HashMap<String, ExceptionRecord>>,
    capacity: usize,
    hard_capacity: Option<usize>,
}

impl ExceptionTracker {
    pub fn new(capacity: usize) -> Self {
        Self::with_hard_capacity(capacity, None)
    }

    /// `hard_capacity`, when set, evicts the least recently seen active
    /// records once pruning resolved and ignored ones is not enough.
    pub fn with_hard_capacity(capacity: usize, hard_capacity: Option<usize>) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: RwLock::new(HashMap::new()),
            capacity,
            hard_capacity: hard_capacity.map(|hard| hard.max(capacity)),
        }
    }

    /// Records one occurrence. Entries without an exception are ignored.
    /// Returns the fingerprint the entry was filed under.
    pub fn track(&self, entry: &LogEntry) -> Option<String> {
        let exception = entry.exception.as_ref()?;
        let fp = fingerprint_of(exception);
        let seen_at = entry.timestamp.unwrap_or_else(Utc::now);

        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = records.get_mut(&fp) {
            record.count += 1;
            if seen_at > record.last_seen {
                record.last_seen = seen_at;
            }
            return Some(fp);
        }

        let first_frame = exception.backtrace.first();
        let record = ExceptionRecord {
            fingerprint: fp.clone(),
            type_: exception.type_.clone(),
            message: exception.message.clone(),
            severity: match entry.level {
                LogLevel::Warning => Severity::Warning,
                _ => Severity::Error,
            },
            first_seen: seen_at,
            last_seen: seen_at,
            count: 1,
            file: first_frame.map(|frame| frame.file.clone()),
            line: first_frame.map(|frame| frame.line),
            stack_trace: exception
                .backtrace
                .iter()
                .map(|frame| frame.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
            context: context_snapshot(entry),
            resolved: false,
            ignored: false,
        };
        debug!(fingerprint = %fp, kind = %record.type_, process = %entry.process, "new exception");
        records.insert(fp.clone(), record);

        if records.len() > self.capacity {
            self.prune(&mut records);
        }
        Some(fp)
    }

    fn prune(&self, records: &mut HashMap<String, ExceptionRecord>) {
        let target = self.capacity * 9 / 10;

        let mut inactive: Vec<_> = records
            .values()
            .filter(|r| !r.is_active())
            .map(|r| (r.last_seen, r.fingerprint.clone()))
            .collect();
        inactive.sort();
        for (_, fp) in inactive {
            if records.len() <= target {
                break;
            }
            records.remove(&fp);
        }

        if records.len() > self.capacity {
            warn!(
                count = records.len(),
                capacity = self.capacity,
                "exception index above soft capacity with no resolved or ignored records left"
            );
        }

        if let Some(hard) = self.hard_capacity {
            if records.len() > hard {
                let mut by_age: Vec<_> = records
                    .values()
                    .map(|r| (r.last_seen, r.fingerprint.clone()))
                    .collect();
                by_age.sort();
                let excess = records.len() - hard;
                for (_, fp) in by_age.into_iter().take(excess) {
                    records.remove(&fp);
                }
            }
        }
    }

    /// Active records, most recently seen first.
    pub fn list(&self) -> Vec<ExceptionRecord> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut active: Vec<_> = records.values().filter(|r| r.is_active()).cloned().collect();
        active.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        active
    }

    pub fn get(&self, fingerprint: &str) -> Option<ExceptionRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned()
    }

    pub fn resolve(&self, fingerprint: &str) -> Result<()> {
        self.update(fingerprint, |record| record.resolved = true)
    }

    pub fn ignore(&self, fingerprint: &str) -> Result<()> {
        self.update(fingerprint, |record| record.ignored = true)
    }

    fn update(&self, fingerprint: &str, apply: impl FnOnce(&mut ExceptionRecord)) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get_mut(fingerprint)
            .ok_or_else(|| SupervisorError::NotFound(fingerprint.to_string()))?;
        apply(record);
        Ok(())
    }

    pub fn clear(&self) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Total records, including resolved and ignored ones.
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ExceptionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_EXCEPTION_CAPACITY)
    }
}

fn context_snapshot(entry: &LogEntry) -> BTreeMap<String, String> {
    let mut context = BTreeMap::new();
    context.insert("process".to_string(), entry.process.clone());
    if let Some(request_id) = &entry.request_id {
        context.insert("request_id".to_string(), request_id.clone());
    }
    if let Some(request) = &entry.request {
        let fields = [
            ("method", &request.method),
            ("path", &request.path),
            ("controller", &request.controller),
            ("action", &request.action),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                context.insert(key.to_string(), value.clone());
            }
        }
    }
    context
}
