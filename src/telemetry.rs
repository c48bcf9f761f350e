//! `TelemetryRecorder` port and the `QueryScope` RAII guard (C10,
//! spec.md §4.10).
//!
//! Grounded in the teacher's `metrics.rs` (thread-local counters plus a
//! `RefreshTimer` started-at-`Instant::now()` helper, exposed through a
//! `*_api` facade module) — generalized from fixed transaction counters
//! to an injectable trait over arbitrary per-query metadata, with
//! drop-without-mark treated as failed per spec.md §4.10/§9 "scoped
//! telemetry resource".

use sha2::{Digest, Sha256};
use std::sync::Arc;

const COMMAND_PREVIEW_LIMIT: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Completed,
    Intercepted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryErrorKind {
    Timeout,
    Cancelled,
    CatalogUnavailable,
    Other,
}

#[derive(Debug, Clone)]
pub struct QueryMetadata {
    pub command_text: String,
    pub object_ref: Option<String>,
}

impl QueryMetadata {
    #[must_use]
    pub fn new(command_text: impl Into<String>) -> Self {
        Self { command_text: command_text.into(), object_ref: None }
    }

    /// Truncates `command_text` to 240 chars, appending `" …"` when it did.
    #[must_use]
    pub fn preview(&self) -> String {
        if self.command_text.chars().count() <= COMMAND_PREVIEW_LIMIT {
            return self.command_text.clone();
        }
        let truncated: String = self.command_text.chars().take(COMMAND_PREVIEW_LIMIT).collect();
        format!("{truncated} …")
    }

    /// SHA-256 hex over the full (untruncated) command text.
    #[must_use]
    pub fn command_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.command_text.as_bytes());
        hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Sink for completed/intercepted/failed query events. No concrete
/// implementation ships in this crate (out of scope, spec.md §1) — a host
/// application wires this to its own metrics backend.
pub trait TelemetryRecorder: Send + Sync {
    fn record(&self, metadata: &QueryMetadata, outcome: QueryOutcome, row_count: u64, error_kind: Option<TelemetryErrorKind>);
}

/// Starts a per-query telemetry scope. Call one of `mark_completed`/
/// `mark_intercepted`/`mark_failed` before the scope is dropped; an
/// unmarked drop is recorded as a failure with `TelemetryErrorKind::Other`.
#[must_use]
pub fn start_query(recorder: Arc<dyn TelemetryRecorder>, metadata: QueryMetadata) -> QueryScope {
    QueryScope { recorder, metadata, marked: false }
}

pub struct QueryScope {
    recorder: Arc<dyn TelemetryRecorder>,
    metadata: QueryMetadata,
    marked: bool,
}

impl QueryScope {
    pub fn mark_completed(mut self, row_count: u64) {
        self.marked = true;
        self.recorder.record(&self.metadata, QueryOutcome::Completed, row_count, None);
    }

    pub fn mark_intercepted(mut self, row_count: u64) {
        self.marked = true;
        self.recorder.record(&self.metadata, QueryOutcome::Intercepted, row_count, None);
    }

    pub fn mark_failed(mut self, row_count: u64, error_kind: TelemetryErrorKind) {
        self.marked = true;
        self.recorder.record(&self.metadata, QueryOutcome::Failed, row_count, Some(error_kind));
    }
}

impl Drop for QueryScope {
    fn drop(&mut self) {
        if !self.marked {
            self.recorder.record(&self.metadata, QueryOutcome::Failed, 0, Some(TelemetryErrorKind::Other));
        }
    }
}

/// In-memory recorder test double, grounded in the teacher's own
/// `QueueStats`/`metrics_api::get_queue_stats` pattern of exposing
/// accumulated counters for assertions.
#[derive(Debug, Default)]
pub struct RecordingTelemetryRecorder {
    events: std::sync::Mutex<Vec<(String, QueryOutcome, u64, Option<TelemetryErrorKind>)>>,
}

impl RecordingTelemetryRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<(String, QueryOutcome, u64, Option<TelemetryErrorKind>)> {
        self.events.lock().unwrap().clone()
    }
}

impl TelemetryRecorder for RecordingTelemetryRecorder {
    fn record(&self, metadata: &QueryMetadata, outcome: QueryOutcome, row_count: u64, error_kind: Option<TelemetryErrorKind>) {
        self.events
            .lock()
            .unwrap()
            .push((metadata.command_hash(), outcome, row_count, error_kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_long_command_text_with_ellipsis() {
        let long = "a".repeat(300);
        let metadata = QueryMetadata::new(long);
        let preview = metadata.preview();
        assert_eq!(preview.chars().count(), COMMAND_PREVIEW_LIMIT + 2);
        assert!(preview.ends_with(" …"));
    }

    #[test]
    fn preview_leaves_short_command_text_untouched() {
        let metadata = QueryMetadata::new("SELECT 1");
        assert_eq!(metadata.preview(), "SELECT 1");
    }

    #[test]
    fn command_hash_is_stable_for_identical_text() {
        let a = QueryMetadata::new("SELECT 1 FROM dbo.T");
        let b = QueryMetadata::new("SELECT 1 FROM dbo.T");
        assert_eq!(a.command_hash(), b.command_hash());
    }

    #[test]
    fn marked_completed_records_exactly_one_completed_event() {
        let recorder = Arc::new(RecordingTelemetryRecorder::new());
        let scope = start_query(recorder.clone(), QueryMetadata::new("SELECT 1"));
        scope.mark_completed(3);

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, QueryOutcome::Completed);
        assert_eq!(events[0].2, 3);
    }

    #[test]
    fn dropping_an_unmarked_scope_records_a_failure() {
        let recorder = Arc::new(RecordingTelemetryRecorder::new());
        {
            let _scope = start_query(recorder.clone(), QueryMetadata::new("SELECT 1"));
        }

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, QueryOutcome::Failed);
        assert_eq!(events[0].3, Some(TelemetryErrorKind::Other));
    }
}
