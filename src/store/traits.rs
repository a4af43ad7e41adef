//! `Database` trait, the single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::context::ResourceDoc;
use crate::conversation::{Conversation, Lead};
use crate::drafts::{Draft, DraftStatus};
use crate::error::DatabaseError;
use crate::ledger::{CanonicalMessage, LedgerEntry};
use crate::stage::FunnelStage;
use crate::transcript::TranscriptEntry;

/// Result of committing a freshly generated draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Stored as the conversation's pending draft, replacing `superseded` if one existed.
    Committed { superseded: Option<Uuid> },
    /// A newer generation started meanwhile; stored as superseded and never shown.
    Stale { current_seq: i64 },
}

/// Status of a retry task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStatus {
    Open,
    Resolved,
}

/// A failed generation waiting to be re-run.
#[derive(Debug, Clone, Serialize)]
pub struct RetryTask {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub reason: String,
    pub attempts: i64,
    pub status: RetryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Backend-agnostic database trait covering conversations, the ledger,
/// drafts, retry tasks and the local resource library.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Create the conversation on first sight, otherwise refresh its lead profile.
    async fn upsert_conversation(
        &self,
        external_id: &str,
        lead: &Lead,
        sender_id: Option<&str>,
    ) -> Result<Conversation, DatabaseError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError>;

    async fn get_conversation_by_external(
        &self,
        external_id: &str,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// Ids of all non-archived conversations, oldest first.
    async fn list_conversation_ids(&self) -> Result<Vec<Uuid>, DatabaseError>;

    /// Replace the cached transcript and the review flag.
    async fn save_transcript(
        &self,
        id: Uuid,
        transcript: &[TranscriptEntry],
        needs_review: bool,
    ) -> Result<(), DatabaseError>;

    /// Flag a conversation for manual review without touching its transcript.
    async fn flag_for_review(&self, id: Uuid) -> Result<(), DatabaseError>;

    async fn set_stage(&self, id: Uuid, stage: FunnelStage) -> Result<(), DatabaseError>;

    /// Start a new generation. Returns the new sequence number.
    async fn bump_generation(&self, id: Uuid) -> Result<i64, DatabaseError>;

    // ── Ledger ──────────────────────────────────────────────────────

    /// Insert unless the dedup key already exists. `None` means duplicate.
    async fn insert_ledger_entry(
        &self,
        conversation_id: Uuid,
        message: &CanonicalMessage,
    ) -> Result<Option<LedgerEntry>, DatabaseError>;

    /// All entries for a conversation ordered by `sent_at`, then id.
    async fn ledger_entries(&self, conversation_id: Uuid) -> Result<Vec<LedgerEntry>, DatabaseError>;

    // ── Drafts ──────────────────────────────────────────────────────

    /// Atomically supersede the current pending draft and store `draft`,
    /// recording its stage on the conversation, if `expected_seq` is still
    /// the conversation's latest generation.
    async fn commit_draft(&self, draft: &Draft, expected_seq: i64) -> Result<CommitOutcome, DatabaseError>;

    async fn get_draft(&self, id: Uuid) -> Result<Option<Draft>, DatabaseError>;

    async fn pending_draft(&self, conversation_id: Uuid) -> Result<Option<Draft>, DatabaseError>;

    /// Pending drafts across all conversations, newest first.
    async fn list_pending_drafts(&self) -> Result<Vec<Draft>, DatabaseError>;

    async fn drafts_for_conversation(&self, conversation_id: Uuid) -> Result<Vec<Draft>, DatabaseError>;

    /// Move a pending draft to `to`. Returns false if it was no longer pending.
    async fn transition_draft(&self, id: Uuid, to: DraftStatus) -> Result<bool, DatabaseError>;

    /// Expire pending drafts created before `older_than`. Returns how many.
    async fn expire_stale_drafts(&self, older_than: DateTime<Utc>) -> Result<usize, DatabaseError>;

    // ── Retry tasks ─────────────────────────────────────────────────

    /// Open a retry task, or bump the attempt count of the open one.
    async fn record_retry_task(&self, conversation_id: Uuid, reason: &str) -> Result<Uuid, DatabaseError>;

    async fn open_retry_tasks(&self) -> Result<Vec<RetryTask>, DatabaseError>;

    /// Close every open task of a conversation. Returns how many.
    async fn resolve_retry_tasks(&self, conversation_id: Uuid) -> Result<usize, DatabaseError>;

    // ── Resources ───────────────────────────────────────────────────

    async fn upsert_resource(&self, doc: &ResourceDoc) -> Result<(), DatabaseError>;

    /// Active documents tagged with `stage`.
    async fn resources_for_stage(&self, stage: FunnelStage) -> Result<Vec<ResourceDoc>, DatabaseError>;
}
