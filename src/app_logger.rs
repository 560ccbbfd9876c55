//! Application log setup and ring buffer.
//!
//! Every `tracing` event is written to stderr and mirrored into a
//! fixed-capacity circular buffer so the renderer can show recent host
//! activity (`GET /logs`) without tailing a file.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A single log entry stored in the ring buffer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: u64,
    pub timestamp_ms: i64,
    pub level: String,
    /// Module path the event came from (`ouroboros_lib::lifecycle`, ...).
    pub source: String,
    pub message: String,
    /// Structured fields rendered as `key=value` pairs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<String>,
}

pub type SharedLogBuffer = Arc<Mutex<LogRingBuffer>>;

// ---------------------------------------------------------------------------
// Ring buffer
// ---------------------------------------------------------------------------

pub const LOG_RING_CAPACITY: usize = 1000;

/// Fixed-capacity circular buffer for log entries.
pub struct LogRingBuffer {
    entries: Vec<Option<LogEntry>>,
    capacity: usize,
    /// Write position (wraps around)
    write_pos: usize,
    /// Number of entries currently stored (<= capacity)
    count: usize,
    next_id: u64,
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self {
            entries,
            capacity,
            write_pos: 0,
            count: 0,
            next_id: 1,
        }
    }

    pub fn shared(capacity: usize) -> SharedLogBuffer {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    /// Push a new entry. Returns the assigned entry ID.
    pub fn push(
        &mut self,
        level: String,
        source: String,
        message: String,
        fields: Option<String>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        self.entries[self.write_pos] = Some(LogEntry {
            id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            level,
            source,
            message,
            fields,
        });
        self.write_pos = (self.write_pos + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }

        id
    }

    /// Most recent `limit` entries, oldest first. `0` returns everything.
    pub fn get_entries(&self, limit: usize) -> Vec<LogEntry> {
        if self.count == 0 {
            return Vec::new();
        }

        let effective_limit = if limit == 0 { self.count } else { limit.min(self.count) };

        // write_pos points at the oldest entry once the buffer is full
        let start = if self.count < self.capacity { 0 } else { self.write_pos };

        let skip = self.count - effective_limit;
        (skip..self.count)
            .filter_map(|i| self.entries[(start + i) % self.capacity].clone())
            .collect()
    }

    /// Remove all entries. IDs keep counting up.
    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|slot| *slot = None);
        self.write_pos = 0;
        self.count = 0;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

// ---------------------------------------------------------------------------
// tracing layer
// ---------------------------------------------------------------------------

/// Mirrors events into a [`LogRingBuffer`].
pub struct RingBufferLayer {
    buffer: SharedLogBuffer,
}

impl RingBufferLayer {
    pub fn new(buffer: SharedLogBuffer) -> Self {
        Self { buffer }
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: String,
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.push_field(field, format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            self.push_field(field, format_args!("{value:?}"));
        }
    }
}

impl EventVisitor {
    fn push_field(&mut self, field: &Field, value: std::fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", field.name(), value);
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for RingBufferLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        let fields = (!visitor.fields.is_empty()).then_some(visitor.fields);
        self.buffer.lock().push(
            meta.level().as_str().to_ascii_lowercase(),
            meta.target().to_string(),
            visitor.message,
            fields,
        );
    }
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Install the global subscriber: `RUST_LOG` filter (default `info`), stderr
/// formatting and the ring buffer. Returns the buffer for the shell API.
///
/// Safe to call more than once; later calls keep the first subscriber.
pub fn init_logging() -> SharedLogBuffer {
    let buffer = LogRingBuffer::shared(LOG_RING_CAPACITY);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(RingBufferLayer::new(buffer.clone()));

    #[cfg(feature = "tokio-console")]
    let result = registry.with(console_subscriber::spawn()).try_init();
    #[cfg(not(feature = "tokio-console"))]
    let result = registry.try_init();

    if let Err(e) = result {
        eprintln!("[app_logger] subscriber already installed: {e}");
    }

    buffer
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
