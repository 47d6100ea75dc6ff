//! End-of-run reporting.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-kind task counts grouped by state, as read from the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskCounts {
    pub planned: u64,
    pub in_progress: u64,
    pub copied: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl TaskCounts {
    pub fn total(&self) -> u64 {
        self.planned + self.in_progress + self.copied + self.failed + self.skipped
    }
}

/// A failed task's identity and its recorded error, for the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTask {
    pub kind: String,
    pub name: String,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Keyed by task kind: "table", "index", "constraint", "sequence".
    pub counts: BTreeMap<String, TaskCounts>,
    pub bytes_transferred: u64,
    pub rows_copied: u64,
    pub failed: Vec<FailedTask>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Human-readable table, logged at the end of a run and printed by
    /// `list progress`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{:<12} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
            "kind", "total", "done", "pending", "failed", "skipped"
        ));
        for (kind, c) in &self.counts {
            out.push_str(&format!(
                "{:<12} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
                kind,
                c.total(),
                c.copied,
                c.planned + c.in_progress,
                c.failed,
                c.skipped
            ));
        }
        out.push_str(&format!(
            "\n{} bytes transferred, {} rows copied\n",
            self.bytes_transferred, self.rows_copied
        ));
        for f in &self.failed {
            out.push_str(&format!(
                "FAILED {} {} after {} attempts: {}\n",
                f.kind, f.name, f.attempts, f.error
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lists_failures() {
        let mut summary = RunSummary::default();
        summary.counts.insert(
            "table".into(),
            TaskCounts {
                copied: 3,
                failed: 1,
                ..Default::default()
            },
        );
        summary.failed.push(FailedTask {
            kind: "table".into(),
            name: "public.users".into(),
            attempts: 5,
            error: "connection reset".into(),
        });
        let rendered = summary.render();
        assert!(rendered.contains("public.users"));
        assert!(rendered.contains("connection reset"));
        assert!(!summary.is_success());
    }
}
