//! Per-run item counts.

use serde::{Deserialize, Serialize};

use crate::ledger::{ItemOutcome, ItemStatus};

/// Copied/skipped/faulted counts of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub copied: u64,
    pub skipped: u64,
    pub faulted: u64,
}

impl Summary {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a ItemOutcome>) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            summary.record(&outcome.status);
        }
        summary
    }

    pub fn record(&mut self, status: &ItemStatus) {
        match status {
            ItemStatus::Completed => self.copied += 1,
            ItemStatus::Skipped => self.skipped += 1,
            ItemStatus::Faulted { .. } => self.faulted += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.copied + self.skipped + self.faulted
    }
}
