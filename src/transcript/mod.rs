//! Role-tagged transcript view derived from the ledger, and its repair.

pub mod model;
pub mod projector;

pub use model::{TranscriptEntry, TranscriptRole};
pub use projector::{RebuildReason, Reconciliation, project, reconcile};

use serde::Serialize;

/// Counts reported by a backfill run over all conversations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub patched: usize,
    pub rebuilt: usize,
    pub skipped: usize,
    pub already_correct: usize,
    pub flagged: usize,
    pub total: usize,
}

impl BackfillReport {
    pub fn tally(&mut self, outcome: &Reconciliation) {
        self.total += 1;
        match outcome {
            Reconciliation::Skipped => self.skipped += 1,
            Reconciliation::Unchanged => self.already_correct += 1,
            Reconciliation::Patched { .. } => self.patched += 1,
            Reconciliation::Rebuilt { .. } => self.rebuilt += 1,
            Reconciliation::NeedsReview { .. } => self.flagged += 1,
        }
    }
}
