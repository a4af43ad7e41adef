//! Transcript projector: keeps the cached transcript derivable from the ledger.
//!
//! [`reconcile`] is a pure function of `(cached transcript, ledger entries)`
//! and decides exactly one [`Reconciliation`]:
//!
//! ```text
//!   ledger empty ── cached empty ──────────────────────────▶ Skipped
//!        │       └─ cached non-empty ──────────────────────▶ NeedsReview
//!        ▼
//!   cached == projection ──────────────────────────────────▶ Unchanged
//!        │
//!   same texts, same order (Phase A) ──────────────────────▶ Patched
//!        │
//!   cached empty ──────────────────────────────────────────▶ Rebuilt(EmptyCache)
//!   no cached text found in the ledger at all ─────────────▶ NeedsReview
//!   no cached operator text matches ledger outbound (B) ───▶ Rebuilt(NoOutboundOverlap)
//!   otherwise ─────────────────────────────────────────────▶ Rebuilt(Diverged)
//! ```
//!
//! Every `Patched`/`Rebuilt` result equals [`project`] of the ledger, so a
//! second run on its output is always `Unchanged`.

use std::collections::HashSet;

use serde::Serialize;

use crate::ledger::{Direction, LedgerEntry};
use crate::transcript::model::{TranscriptEntry, TranscriptRole};

/// Why the transcript was rebuilt from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildReason {
    /// Nothing was cached yet.
    EmptyCache,
    /// Phase B: the cached operator lines share nothing with the ledger's outbound entries.
    NoOutboundOverlap,
    /// Entries are missing from or extra in the cache.
    Diverged,
}

/// Outcome of reconciling one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Both sides empty.
    Skipped,
    /// Cached transcript already matches the ledger.
    Unchanged,
    /// Phase A: roles relabelled in place; no entries added or removed.
    Patched {
        transcript: Vec<TranscriptEntry>,
        relabeled: usize,
    },
    /// Transcript replaced by the ledger projection.
    Rebuilt {
        transcript: Vec<TranscriptEntry>,
        reason: RebuildReason,
    },
    /// History cannot be matched to the ledger; left untouched for a human.
    NeedsReview { reason: &'static str },
}

impl Reconciliation {
    /// The transcript to persist, if this outcome changes it.
    pub fn transcript(&self) -> Option<&[TranscriptEntry]> {
        match self {
            Reconciliation::Patched { transcript, .. } | Reconciliation::Rebuilt { transcript, .. } => {
                Some(transcript)
            }
            _ => None,
        }
    }
}

/// Canonical transcript for a set of ledger entries: ordered by `sent_at`,
/// ties broken by ledger id, role taken from direction.
pub fn project(entries: &[LedgerEntry]) -> Vec<TranscriptEntry> {
    let mut ordered: Vec<&LedgerEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.id.cmp(&b.id)));
    ordered
        .into_iter()
        .map(|e| TranscriptEntry {
            role: TranscriptRole::from(e.direction),
            text: e.content.clone(),
            timestamp: e.sent_at,
        })
        .collect()
}

/// Decide how to bring `cached` into agreement with `entries`.
pub fn reconcile(cached: &[TranscriptEntry], entries: &[LedgerEntry]) -> Reconciliation {
    if entries.is_empty() {
        return if cached.is_empty() {
            Reconciliation::Skipped
        } else {
            Reconciliation::NeedsReview {
                reason: "cached transcript has entries but the ledger is empty",
            }
        };
    }

    let canonical = project(entries);
    if cached == canonical.as_slice() {
        return Reconciliation::Unchanged;
    }

    if let Some(relabeled) = phase_a(cached, &canonical) {
        return Reconciliation::Patched {
            transcript: canonical,
            relabeled,
        };
    }

    if cached.is_empty() {
        return Reconciliation::Rebuilt {
            transcript: canonical,
            reason: RebuildReason::EmptyCache,
        };
    }

    let ledger_texts: HashSet<&str> = entries.iter().map(|e| e.content.as_str()).collect();
    if !cached.iter().any(|t| ledger_texts.contains(t.text.as_str())) {
        return Reconciliation::NeedsReview {
            reason: "no cached transcript entry matches any ledger entry",
        };
    }

    let reason = if outbound_overlap(cached, entries) == 0 {
        RebuildReason::NoOutboundOverlap
    } else {
        RebuildReason::Diverged
    };
    Reconciliation::Rebuilt {
        transcript: canonical,
        reason,
    }
}

/// Phase A applies when the texts line up one-to-one with the projection.
/// Returns the number of entries whose role had to change.
fn phase_a(cached: &[TranscriptEntry], canonical: &[TranscriptEntry]) -> Option<usize> {
    if cached.len() != canonical.len() {
        return None;
    }
    if cached.iter().zip(canonical).any(|(c, p)| c.text != p.text) {
        return None;
    }
    Some(cached.iter().zip(canonical).filter(|(c, p)| c.role != p.role).count())
}

/// Cached operator-labelled lines whose text matches a ledger outbound entry.
fn outbound_overlap(cached: &[TranscriptEntry], entries: &[LedgerEntry]) -> usize {
    let outbound: HashSet<&str> = entries
        .iter()
        .filter(|e| e.direction == Direction::Outbound)
        .map(|e| e.content.as_str())
        .collect();
    cached
        .iter()
        .filter(|t| t.role == TranscriptRole::Operator && outbound.contains(t.text.as_str()))
        .count()
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use uuid::Uuid;

    use super::*;

    fn base() -> DateTime<Utc> {
        "2026-01-28T10:00:00Z".parse().unwrap()
    }

    fn entry(id: i64, direction: Direction, content: &str, minute: i64) -> LedgerEntry {
        LedgerEntry {
            id,
            conversation_id: Uuid::nil(),
            direction,
            content: content.to_string(),
            sent_at: base() + Duration::minutes(minute),
            campaign: None,
            inserted_at: base(),
        }
    }

    fn line(role: TranscriptRole, text: &str, minute: i64) -> TranscriptEntry {
        TranscriptEntry {
            role,
            text: text.to_string(),
            timestamp: base() + Duration::minutes(minute),
        }
    }

    fn assert_roles_match_directions(transcript: &[TranscriptEntry], entries: &[LedgerEntry]) {
        let canonical = project(entries);
        assert_eq!(transcript, canonical.as_slice());
        for (t, e) in transcript.iter().zip(entries) {
            assert_eq!(t.role, TranscriptRole::from(e.direction));
        }
    }

    #[test]
    fn projection_orders_by_sent_at_then_id() {
        let entries = vec![
            entry(3, Direction::Inbound, "later", 5),
            entry(2, Direction::Inbound, "tie-b", 1),
            entry(1, Direction::Outbound, "tie-a", 1),
        ];
        let texts: Vec<String> = project(&entries).into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["tie-a", "tie-b", "later"]);
    }

    #[test]
    fn phase_a_relabels_mislabelled_outbound() {
        let entries = vec![
            entry(1, Direction::Outbound, "Hey", 0),
            entry(2, Direction::Inbound, "Hi back", 1),
        ];
        let cached = vec![
            line(TranscriptRole::Lead, "Hey", 0),
            line(TranscriptRole::Lead, "Hi back", 1),
        ];
        match reconcile(&cached, &entries) {
            Reconciliation::Patched { transcript, relabeled } => {
                assert_eq!(relabeled, 1);
                assert_eq!(transcript[0].role, TranscriptRole::Operator);
                assert_eq!(transcript[0].text, "Hey");
                assert_eq!(transcript[1].role, TranscriptRole::Lead);
                assert_eq!(transcript[1].text, "Hi back");
            }
            other => panic!("expected patch, got {other:?}"),
        }
    }

    #[test]
    fn phase_b_rebuilds_when_no_outbound_overlap() {
        let entries = vec![
            entry(1, Direction::Outbound, "Intro note", 0),
            entry(2, Direction::Outbound, "Follow-up", 10),
            entry(3, Direction::Inbound, "Sure, tell me more", 20),
            entry(4, Direction::Outbound, "Here's the deck", 30),
        ];
        let cached = vec![line(TranscriptRole::Lead, "Sure, tell me more", 20)];
        match reconcile(&cached, &entries) {
            Reconciliation::Rebuilt { transcript, reason } => {
                assert_eq!(reason, RebuildReason::NoOutboundOverlap);
                assert_eq!(transcript.len(), 4);
                assert_roles_match_directions(&transcript, &entries);
            }
            other => panic!("expected rebuild, got {other:?}"),
        }
    }

    #[test]
    fn missing_new_entry_triggers_rebuild() {
        let entries = vec![
            entry(1, Direction::Outbound, "Hey", 0),
            entry(2, Direction::Inbound, "Hi back", 1),
            entry(3, Direction::Inbound, "Are you there?", 2),
        ];
        let cached = project(&entries[..2]);
        match reconcile(&cached, &entries) {
            Reconciliation::Rebuilt { transcript, reason } => {
                assert_eq!(reason, RebuildReason::Diverged);
                assert_roles_match_directions(&transcript, &entries);
            }
            other => panic!("expected rebuild, got {other:?}"),
        }
    }

    #[test]
    fn extra_cached_entry_is_not_kept() {
        let entries = vec![entry(1, Direction::Outbound, "Hey", 0)];
        let cached = vec![
            line(TranscriptRole::Operator, "Hey", 0),
            line(TranscriptRole::Lead, "invented", 1),
        ];
        let outcome = reconcile(&cached, &entries);
        let transcript = outcome.transcript().unwrap();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].text, "Hey");
    }

    #[test]
    fn empty_cache_is_rebuilt() {
        let entries = vec![entry(1, Direction::Inbound, "Hello", 0)];
        assert!(matches!(
            reconcile(&[], &entries),
            Reconciliation::Rebuilt {
                reason: RebuildReason::EmptyCache,
                ..
            }
        ));
    }

    #[test]
    fn consistent_transcript_is_unchanged() {
        let entries = vec![
            entry(1, Direction::Outbound, "Hey", 0),
            entry(2, Direction::Inbound, "Hi back", 1),
        ];
        let cached = project(&entries);
        assert_eq!(reconcile(&cached, &entries), Reconciliation::Unchanged);
    }

    #[test]
    fn second_run_after_repair_is_a_no_op() {
        let entries = vec![
            entry(1, Direction::Outbound, "Hey", 0),
            entry(2, Direction::Inbound, "Hi back", 1),
            entry(3, Direction::Outbound, "Want to hop on a call?", 2),
        ];
        let inputs = vec![
            vec![],
            vec![line(TranscriptRole::Lead, "Hi back", 1)],
            vec![
                line(TranscriptRole::Lead, "Hey", 0),
                line(TranscriptRole::Lead, "Hi back", 1),
                line(TranscriptRole::Lead, "Want to hop on a call?", 2),
            ],
        ];
        for cached in inputs {
            let first = reconcile(&cached, &entries);
            let repaired = first.transcript().unwrap().to_vec();
            assert_roles_match_directions(&repaired, &entries);
            assert_eq!(reconcile(&repaired, &entries), Reconciliation::Unchanged);
        }
    }

    #[test]
    fn unmatched_history_is_flagged_not_cleared() {
        let entries = vec![entry(1, Direction::Inbound, "Hello", 0)];
        let cached = vec![line(TranscriptRole::Lead, "something else entirely", 0)];
        assert!(matches!(reconcile(&cached, &entries), Reconciliation::NeedsReview { .. }));
    }

    #[test]
    fn empty_ledger_with_history_is_flagged() {
        let cached = vec![line(TranscriptRole::Lead, "Hello", 0)];
        assert!(matches!(reconcile(&cached, &[]), Reconciliation::NeedsReview { .. }));
    }

    #[test]
    fn nothing_on_either_side_is_skipped() {
        assert_eq!(reconcile(&[], &[]), Reconciliation::Skipped);
    }
}
