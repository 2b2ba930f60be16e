//! Results of sync passes.

use serde::Serialize;

/// Outcome of one document pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileSyncReport {
    pub path: String,
    pub detected: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub orphaned: usize,
    /// Blocks dropped by extraction (empty content).
    pub rejected: usize,
    pub errors: Vec<String>,
}

impl FileSyncReport {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }

    /// Annotations that reached a final state in this pass.
    pub fn processed(&self) -> usize {
        self.created + self.updated + self.unchanged + self.orphaned
    }

    /// True when the pass changed neither documents nor cards.
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.orphaned == 0
    }
}

/// Outcome of a multi-document operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub files: Vec<FileSyncReport>,
    pub totals: FileSyncReport,
    /// Documents whose pass failed outright, with the reason.
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn push(&mut self, report: FileSyncReport) {
        self.totals.detected += report.detected;
        self.totals.created += report.created;
        self.totals.updated += report.updated;
        self.totals.unchanged += report.unchanged;
        self.totals.skipped += report.skipped;
        self.totals.orphaned += report.orphaned;
        self.totals.rejected += report.rejected;
        self.totals.errors.extend(report.errors.iter().cloned());
        self.files.push(report);
    }

    pub fn push_failure(&mut self, path: &str, error: String) {
        self.failed.push((path.to_string(), error));
    }
}

/// Outcome of mirroring a card into its other sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    pub written: usize,
    pub unchanged: usize,
    /// Sources whose document or anchor no longer exists.
    pub stale: Vec<(String, String)>,
    pub failed: usize,
}

impl FanOutReport {
    pub fn merge(&mut self, other: FanOutReport) {
        self.written += other.written;
        self.unchanged += other.unchanged;
        self.stale.extend(other.stale);
        self.failed += other.failed;
    }
}
