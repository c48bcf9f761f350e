//! `WarningAggregator` — deduplicates identical non-fatal warnings raised
//! during a run and emits a descending-count summary at the end (spec.md
//! §7 "a warning aggregator deduplicates identical messages... sorted by
//! descending count").
//!
//! Grounded in the teacher's `metrics.rs` thread-local counter pattern,
//! generalized from fixed numeric counters to a `HashMap<String, usize>`
//! message tally.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct WarningAggregator {
    counts: Mutex<HashMap<String, usize>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningSummaryEntry {
    pub message: String,
    pub count: usize,
}

impl WarningAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one occurrence of `message`, deduplicating by exact text.
    pub fn record(&self, message: impl Into<String>) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(message.into()).or_insert(0) += 1;
        drop(counts);
    }

    /// Returns distinct messages sorted by descending count, ties broken
    /// by first-seen-insertion-order-independent alphabetical order (a
    /// `HashMap` carries no insertion order of its own).
    #[must_use]
    pub fn summary(&self) -> Vec<WarningSummaryEntry> {
        let counts = self.counts.lock().unwrap();
        let mut entries: Vec<WarningSummaryEntry> = counts
            .iter()
            .map(|(message, count)| WarningSummaryEntry { message: message.clone(), count: *count })
            .collect();
        entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
        entries
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.counts.lock().unwrap().values().sum()
    }

    /// Logs the summary via `tracing::warn!`, one line per distinct
    /// message, most frequent first. Called once at the end of a run.
    pub fn emit(&self) {
        for entry in self.summary() {
            tracing::warn!(count = entry.count, message = %entry.message, "recoverable diagnostic");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_messages_are_deduplicated_into_one_counted_entry() {
        let aggregator = WarningAggregator::new();
        aggregator.record("no CREATE PROCEDURE header found");
        aggregator.record("no CREATE PROCEDURE header found");
        aggregator.record("no top-level AS found");

        let summary = aggregator.summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].message, "no CREATE PROCEDURE header found");
        assert_eq!(summary[0].count, 2);
        assert_eq!(summary[1].count, 1);
    }

    #[test]
    fn total_counts_every_recorded_occurrence() {
        let aggregator = WarningAggregator::new();
        aggregator.record("a");
        aggregator.record("a");
        aggregator.record("b");
        assert_eq!(aggregator.total(), 3);
    }

    #[test]
    fn empty_aggregator_has_empty_summary() {
        let aggregator = WarningAggregator::new();
        assert!(aggregator.summary().is_empty());
        assert_eq!(aggregator.total(), 0);
    }
}
