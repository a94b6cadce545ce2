//! Shared activity log handle.
//!
//! Components receive a cheaply-cloneable [`ActivityLog`] at construction
//! instead of reaching for a process-wide logger. Writes are serialized
//! through a mutex; tool calls are handled one at a time so contention is
//! limited to concurrent `start_run` callers.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::logger::jsonl::{JsonlConfig, JsonlWriter, LogEntry};

/// Cloneable handle over one [`JsonlWriter`].
#[derive(Clone)]
pub struct ActivityLog {
    writer: Arc<Mutex<JsonlWriter>>,
}

impl ActivityLog {
    /// Open (or create) the activity log at `path`.
    #[must_use]
    pub fn open(path: PathBuf) -> Self {
        Self {
            writer: Arc::new(Mutex::new(JsonlWriter::open(JsonlConfig::at(path)))),
        }
    }

    /// A log that drops every entry.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            writer: Arc::new(Mutex::new(JsonlWriter::discard())),
        }
    }

    pub fn record(&self, entry: &LogEntry) {
        self.writer.lock().write_entry(entry);
    }

    /// Degradation state of the underlying writer.
    #[must_use]
    pub fn state(&self) -> String {
        self.writer.lock().state().to_string()
    }
}

impl std::fmt::Debug for ActivityLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityLog")
            .field("state", &self.state())
            .finish()
    }
}
