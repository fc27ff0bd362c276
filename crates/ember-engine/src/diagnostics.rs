//! Diagnostic capture.
//!
//! Every warning the engine or the entity runtime emits goes through
//! `tracing`. [`DiagnosticLayer`] is a `tracing-subscriber` layer that keeps
//! the most recent WARN and ERROR events in a bounded [`DiagnosticLog`], so
//! debug windows (and tests) can show them without scraping the console.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

/// Default number of entries a [`DiagnosticLog`] keeps.
pub const DEFAULT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// DiagnosticLog
// ---------------------------------------------------------------------------

/// One captured warning or error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedDiagnostic {
    /// Severity of the event.
    pub level: Level,
    /// Module path the event was emitted from.
    pub target: String,
    /// Formatted message.
    pub message: String,
    /// Breadcrumb of the JSON value being read, when there was one.
    pub location: Option<String>,
    /// Remaining structured fields, rendered.
    pub fields: Vec<(String, String)>,
}

impl fmt::Display for LoggedDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.level, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " (at {location})")?;
        }
        Ok(())
    }
}

/// Bounded, shareable ring buffer of captured diagnostics. Cloning shares
/// the buffer.
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    entries: Arc<Mutex<VecDeque<LoggedDiagnostic>>>,
    capacity: usize,
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DiagnosticLog {
    /// An empty log keeping at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    /// Record `entry`, evicting the oldest one when full.
    pub fn push(&self, entry: LoggedDiagnostic) {
        // A poisoned lock only means another thread panicked mid-push; the
        // buffer itself is still usable.
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Captured entries, oldest first.
    pub fn entries(&self) -> Vec<LoggedDiagnostic> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every retained entry.
    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Maximum number of retained entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Layer feeding this log.
    pub fn layer(&self) -> DiagnosticLayer {
        DiagnosticLayer { log: self.clone() }
    }
}

// ---------------------------------------------------------------------------
// DiagnosticLayer
// ---------------------------------------------------------------------------

/// `tracing-subscriber` layer recording WARN and ERROR events.
#[derive(Debug, Clone)]
pub struct DiagnosticLayer {
    log: DiagnosticLog,
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    location: Option<String>,
    fields: Vec<(String, String)>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_owned(),
            "location" => self.location = Some(value.to_owned()),
            name => self.fields.push((name.to_owned(), value.to_owned())),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        match field.name() {
            "message" => self.message = rendered,
            "location" => self.location = Some(rendered),
            name => self.fields.push((name.to_owned(), rendered)),
        }
    }
}

impl<S: Subscriber> Layer<S> for DiagnosticLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // ERROR < WARN < INFO in tracing's ordering.
        if *metadata.level() > Level::WARN {
            return;
        }
        let mut collector = FieldCollector::default();
        event.record(&mut collector);
        self.log.push(LoggedDiagnostic {
            level: *metadata.level(),
            target: metadata.target().to_owned(),
            message: collector.message,
            location: collector.location,
            fields: collector.fields,
        });
    }
}

/// Install the global subscriber: `RUST_LOG` filtering (default `info`),
/// console output, and capture into `log`.
pub fn init_logging(log: &DiagnosticLog) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(log.layer())
        .try_init()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
