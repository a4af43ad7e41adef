//! Message ledger: append-only, deduplicated record of who said what, when.
//!
//! The storage layer enforces the dedup key
//! `(conversation, direction, normalized content, sent_at minute)` with a
//! unique constraint, so concurrent deliveries of the same message can never
//! both insert. A duplicate is reported as [`RecordOutcome::Duplicate`], not
//! an error. Existing entries are never modified.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;

/// Direction of a message relative to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sent by the lead.
    Inbound,
    /// Sent by the operator side.
    Outbound,
}

impl Direction {
    /// The upstream `is_reply` flag is the only authority for direction.
    pub fn from_is_reply(is_reply: bool) -> Self {
        if is_reply {
            Direction::Inbound
        } else {
            Direction::Outbound
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

/// Campaign the operator-side message was sent under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Option<String>,
    pub name: Option<String>,
}

/// A normalized message, ready to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalMessage {
    pub direction: Direction,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub campaign: Option<Campaign>,
}

impl CanonicalMessage {
    pub fn content_key(&self) -> String {
        content_key(&self.content)
    }

    pub fn sent_minute(&self) -> i64 {
        sent_minute(self.sent_at)
    }
}

/// A persisted ledger entry. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub conversation_id: Uuid,
    pub direction: Direction,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub campaign: Option<Campaign>,
    pub inserted_at: DateTime<Utc>,
}

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

/// Dedup form of message content: trimmed with inner whitespace collapsed.
pub fn content_key(content: &str) -> String {
    WHITESPACE.replace_all(content.trim(), " ").into_owned()
}

/// Minute bucket used by the dedup key.
pub fn sent_minute(sent_at: DateTime<Utc>) -> i64 {
    sent_at.timestamp().div_euclid(60)
}

/// Result of recording a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted(LedgerEntry),
    Duplicate,
}

/// Totals for a batch of messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub inserted: usize,
    pub inbound_inserted: usize,
    pub duplicates: usize,
}

/// Ledger facade over the database.
#[derive(Clone)]
pub struct MessageLedger {
    db: Arc<dyn Database>,
}

impl MessageLedger {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Append one message unless an entry with the same dedup key exists.
    pub async fn record(
        &self,
        conversation_id: Uuid,
        message: &CanonicalMessage,
    ) -> Result<RecordOutcome, DatabaseError> {
        match self.db.insert_ledger_entry(conversation_id, message).await? {
            Some(entry) => {
                debug!(
                    conversation_id = %conversation_id,
                    entry_id = entry.id,
                    direction = %entry.direction,
                    "Ledger entry recorded"
                );
                Ok(RecordOutcome::Inserted(entry))
            }
            None => {
                debug!(
                    conversation_id = %conversation_id,
                    direction = %message.direction,
                    "Duplicate message skipped"
                );
                Ok(RecordOutcome::Duplicate)
            }
        }
    }

    /// Record every message of a webhook window.
    pub async fn record_all(
        &self,
        conversation_id: Uuid,
        messages: &[CanonicalMessage],
    ) -> Result<RecordSummary, DatabaseError> {
        let mut summary = RecordSummary::default();
        for message in messages {
            match self.record(conversation_id, message).await? {
                RecordOutcome::Inserted(entry) => {
                    summary.inserted += 1;
                    if entry.direction == Direction::Inbound {
                        summary.inbound_inserted += 1;
                    }
                }
                RecordOutcome::Duplicate => summary.duplicates += 1,
            }
        }
        Ok(summary)
    }

    /// All entries for a conversation in canonical order.
    pub async fn entries(&self, conversation_id: Uuid) -> Result<Vec<LedgerEntry>, DatabaseError> {
        self.db.ledger_entries(conversation_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Lead;
    use crate::store::LibSqlBackend;

    fn message(direction: Direction, content: &str, ts: &str) -> CanonicalMessage {
        CanonicalMessage {
            direction,
            content: content.to_string(),
            sent_at: ts.parse().unwrap(),
            campaign: None,
        }
    }

    async fn setup() -> (MessageLedger, Uuid) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let lead = Lead {
            full_name: "Dana Reyes".into(),
            ..Default::default()
        };
        let conv = db.upsert_conversation("conv-1", &lead, None).await.unwrap();
        (MessageLedger::new(db), conv.id)
    }

    #[test]
    fn content_key_collapses_whitespace() {
        assert_eq!(content_key("  Hi   there\n\tfriend "), "Hi there friend");
    }

    #[test]
    fn sent_minute_truncates_seconds() {
        let a: DateTime<Utc> = "2026-01-28T10:00:05Z".parse().unwrap();
        let b: DateTime<Utc> = "2026-01-28T10:00:59Z".parse().unwrap();
        let c: DateTime<Utc> = "2026-01-28T10:01:00Z".parse().unwrap();
        assert_eq!(sent_minute(a), sent_minute(b));
        assert_ne!(sent_minute(b), sent_minute(c));
    }

    #[test]
    fn is_reply_decides_direction() {
        assert_eq!(Direction::from_is_reply(true), Direction::Inbound);
        assert_eq!(Direction::from_is_reply(false), Direction::Outbound);
    }

    #[tokio::test]
    async fn recording_same_event_twice_inserts_once() {
        let (ledger, conv_id) = setup().await;
        let msg = message(Direction::Inbound, "Sounds interesting", "2026-01-28T10:00:00Z");

        assert!(matches!(ledger.record(conv_id, &msg).await.unwrap(), RecordOutcome::Inserted(_)));
        assert_eq!(ledger.record(conv_id, &msg).await.unwrap(), RecordOutcome::Duplicate);
        assert_eq!(ledger.entries(conv_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_minute_and_whitespace_variant_is_duplicate() {
        let (ledger, conv_id) = setup().await;
        let first = message(Direction::Inbound, "Sounds  interesting", "2026-01-28T10:00:02Z");
        let second = message(Direction::Inbound, "Sounds interesting ", "2026-01-28T10:00:48Z");
        ledger.record(conv_id, &first).await.unwrap();
        assert_eq!(ledger.record(conv_id, &second).await.unwrap(), RecordOutcome::Duplicate);
    }

    #[tokio::test]
    async fn same_text_other_direction_is_distinct() {
        let (ledger, conv_id) = setup().await;
        let summary = ledger
            .record_all(
                conv_id,
                &[
                    message(Direction::Outbound, "Thanks!", "2026-01-28T10:00:00Z"),
                    message(Direction::Inbound, "Thanks!", "2026-01-28T10:00:00Z"),
                    message(Direction::Inbound, "Thanks!", "2026-01-28T10:05:00Z"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.inbound_inserted, 2);
        assert_eq!(summary.duplicates, 0);
    }

    #[tokio::test]
    async fn concurrent_duplicates_insert_once() {
        let (ledger, conv_id) = setup().await;
        let msg = message(Direction::Inbound, "Let's talk", "2026-01-28T10:00:00Z");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            let msg = msg.clone();
            handles.push(tokio::spawn(async move { ledger.record(conv_id, &msg).await.unwrap() }));
        }
        let mut inserted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), RecordOutcome::Inserted(_)) {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(ledger.entries(conv_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn entries_come_back_in_sent_order() {
        let (ledger, conv_id) = setup().await;
        ledger
            .record_all(
                conv_id,
                &[
                    message(Direction::Inbound, "second", "2026-01-28T11:00:00Z"),
                    message(Direction::Outbound, "first", "2026-01-28T10:00:00Z"),
                ],
            )
            .await
            .unwrap();
        let entries = ledger.entries(conv_id).await.unwrap();
        assert_eq!(entries[0].content, "first");
        assert_eq!(entries[1].content, "second");
    }
}
