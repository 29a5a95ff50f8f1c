use crate::models::{LogEntry, LogLevel};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

pub const DEFAULT_LOG_CAPACITY: usize = 10_000;
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;

pub type IngestCallback = Arc<dyn Fn(&LogEntry) + Send + Sync>;

/// Conjunctive filter for [`LogStreamer::query`]. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub process: Option<String>,
    pub level: Option<LogLevel>,
    pub request_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Case-insensitive substring over the raw text or the parsed message.
    pub search: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl LogFilter {
    fn matches(&self, entry: &LogEntry, needle: Option<&str>) -> bool {
        if let Some(process) = &self.process {
            if &entry.process != process {
                return false;
            }
        }
        if let Some(level) = self.level {
            if entry.level != level {
                return false;
            }
        }
        if let Some(request_id) = &self.request_id {
            if entry.request_id.as_ref() != Some(request_id) {
                return false;
            }
        }
        if self.since.is_some() || self.until.is_some() {
            let Some(ts) = entry.timestamp else {
                return false;
            };
            if self.since.is_some_and(|since| ts < since) {
                return false;
            }
            if self.until.is_some_and(|until| ts >= until) {
                return false;
            }
        }
        if let Some(needle) = needle {
            if !entry.raw.to_lowercase().contains(needle)
                && !entry.message.to_lowercase().contains(needle)
            {
                return false;
            }
        }
        true
    }
}

/// Fixed-capacity circular store. Slots are allocated once and overwritten
/// in place when the buffer wraps.
struct RingBuffer {
    slots: Vec<Option<Arc<LogEntry>>>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push(&mut self, entry: Arc<LogEntry>) {
        let capacity = self.capacity();
        let tail = (self.head + self.len) % capacity;
        self.slots[tail] = Some(entry);
        if self.len == capacity {
            self.head = (self.head + 1) % capacity;
        } else {
            self.len += 1;
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<LogEntry>> + '_ {
        let capacity = self.capacity();
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % capacity].as_ref())
    }

    fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.len = 0;
    }
}

/// Live feed handed out by [`LogStreamer::subscribe`].
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Arc<LogEntry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Arc<LogEntry>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<LogEntry>> {
        self.receiver.try_recv().ok()
    }
}

/// Bounded in-memory log store with live fan-out.
///
/// The ring buffer and the subscriber set sit behind separate locks so that
/// subscribe/unsubscribe churn never blocks writers or queries.
pub struct LogStreamer {
    buffer: Mutex<RingBuffer>,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<Arc<LogEntry>>>>,
    next_subscriber: AtomicU64,
    queue_size: usize,
    dropped: AtomicU64,
    on_ingest: RwLock<Option<IngestCallback>>,
}

impl LogStreamer {
    pub fn new(capacity: usize) -> Self {
        Self::with_queue_size(capacity, DEFAULT_SUBSCRIBER_QUEUE)
    }

    /// A capacity or queue size of zero is raised to one.
    pub fn with_queue_size(capacity: usize, queue_size: usize) -> Self {
        Self {
            buffer: Mutex::new(RingBuffer::with_capacity(capacity.max(1))),
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            queue_size: queue_size.max(1),
            dropped: AtomicU64::new(0),
            on_ingest: RwLock::new(None),
        }
    }

    /// Installs the callback run after every append, outside all locks.
    pub fn set_ingest_callback(&self, callback: IngestCallback) {
        *self
            .on_ingest
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn append(&self, mut entry: LogEntry) -> Arc<LogEntry> {
        if entry.id.as_deref().map_or(true, str::is_empty) {
            entry.id = Some(uuid::Uuid::new_v4().to_string());
        }
        if entry.timestamp.is_none() {
            entry.timestamp = Some(Utc::now());
        }
        let entry = Arc::new(entry);

        {
            // fan-out happens under the buffer lock so every subscriber sees
            // entries in buffer order; try_send never blocks
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.push(entry.clone());
            self.notify(&entry);
        }

        // the tracker aggregates by fingerprint, so concurrent appends may
        // reach it in either order
        let callback = self
            .on_ingest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(&entry);
        }

        entry
    }

    fn notify(&self, entry: &Arc<LogEntry>) {
        let mut closed = Vec::new();
        {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for (id, sender) in subscribers.iter() {
                match sender.try_send(entry.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for id in closed {
                subscribers.remove(&id);
                debug!(subscriber = id, "pruned closed log subscriber");
            }
        }
    }

    pub fn query(&self, filter: &LogFilter) -> Vec<Arc<LogEntry>> {
        let needle = filter.search.as_ref().map(|s| s.to_lowercase());
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let matching = buffer
            .iter()
            .filter(|entry| filter.matches(entry, needle.as_deref()))
            .skip(filter.offset)
            .cloned();

        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.queue_size);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sender);
        Subscription { id, receiver }
    }

    /// Returns whether the token referred to a live subscription.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn clear(&self) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn count(&self) -> usize {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).len
    }

    pub fn capacity(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .capacity()
    }

    /// Entries dropped because a subscriber's queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for LogStreamer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
