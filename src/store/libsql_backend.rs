//! libSQL backend, the async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All writes go through
//! `write_lock`, so multi-statement operations can run in a transaction on
//! the shared connection without interleaving with other writers.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::ResourceDoc;
use crate::conversation::{Conversation, Lead};
use crate::drafts::{Draft, DraftStatus, QaAnnotation};
use crate::error::DatabaseError;
use crate::ledger::{Campaign, CanonicalMessage, Direction, LedgerEntry};
use crate::stage::FunnelStage;
use crate::store::migrations;
use crate::store::traits::{CommitOutcome, Database, RetryStatus, RetryTask};
use crate::transcript::TranscriptEntry;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run arbitrary SQL, for tests that need rows the API cannot produce.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute_batch(sql)
            .await
            .map_err(|e| DatabaseError::Query(format!("execute_raw: {e}")))?;
        Ok(())
    }

    async fn query_conversation(
        &self,
        filter: &str,
        value: String,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE {filter} = ?1"),
                params![value],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_conversation(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_conversation: {e}"))),
        }
    }

    async fn query_drafts(&self, sql: &str, args: Vec<libsql::Value>) -> Result<Vec<Draft>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("query_drafts: {e}")))?;

        let mut drafts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_draft(&row) {
                Ok(draft) => drafts.push(draft),
                Err(e) => warn!("Skipping draft row: {e}"),
            }
        }
        Ok(drafts)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 in UTC, so text comparison orders correctly.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_err(context: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{context} row parse: {e}"))
}

const CONVERSATION_COLUMNS: &str = "id, external_id, lead_json, sender_id, funnel_stage, transcript_json, generation_seq, needs_review, archived, last_message_at, created_at, updated_at";

const LEDGER_COLUMNS: &str = "id, conversation_id, direction, content, sent_at, campaign_id, campaign_name, inserted_at";

const DRAFT_COLUMNS: &str = "id, conversation_id, text, stage, stage_rationale, status, guidance, model, cost_usd, qa_json, created_at, updated_at";

const RETRY_COLUMNS: &str = "id, conversation_id, reason, attempts, status, created_at, updated_at";

const RESOURCE_COLUMNS: &str = "id, title, category, content, priority, stages_json, is_active";

/// Map a libsql Row to a Conversation. Column order matches CONVERSATION_COLUMNS.
fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let err = row_err("conversation");
    let id: String = row.get(0).map_err(&err)?;
    let lead_json: String = row.get(2).map_err(&err)?;
    let stage_str: String = row.get(4).map_err(&err)?;
    let transcript_json: String = row.get(5).map_err(&err)?;
    let last_message: Option<String> = row.get(9).ok();
    let created: String = row.get(10).map_err(&err)?;
    let updated: String = row.get(11).map_err(&err)?;

    let lead: Lead = serde_json::from_str(&lead_json)
        .map_err(|e| DatabaseError::Serialization(format!("lead_json for {id}: {e}")))?;
    let funnel_stage = stage_str.parse::<FunnelStage>().unwrap_or_else(|e| {
        warn!(conversation_id = %id, error = %e, "Unknown stored stage, reading as default");
        FunnelStage::default()
    });
    // An unreadable cache is surfaced, never silently emptied: the stored
    // JSON stays as is until someone looks at it.
    let parsed: Result<Vec<TranscriptEntry>, _> = serde_json::from_str(&transcript_json);
    let (transcript, transcript_unreadable) = match parsed {
        Ok(entries) => (entries, false),
        Err(e) => {
            warn!(conversation_id = %id, error = %e, "Unreadable cached transcript");
            (Vec::new(), true)
        }
    };

    Ok(Conversation {
        id: parse_uuid(&id)?,
        external_id: row.get(1).map_err(&err)?,
        lead,
        sender_id: row.get(3).ok(),
        funnel_stage,
        transcript,
        transcript_unreadable,
        generation_seq: row.get(6).map_err(&err)?,
        needs_review: row.get::<i64>(7).map_err(&err)? != 0,
        archived: row.get::<i64>(8).map_err(&err)? != 0,
        last_message_at: parse_optional_datetime(&last_message),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_ledger_entry(row: &libsql::Row) -> Result<LedgerEntry, DatabaseError> {
    let err = row_err("ledger_entry");
    let conversation_id: String = row.get(1).map_err(&err)?;
    let direction: String = row.get(2).map_err(&err)?;
    let sent_at: String = row.get(4).map_err(&err)?;
    let campaign_id: Option<String> = row.get(5).ok();
    let campaign_name: Option<String> = row.get(6).ok();
    let inserted_at: String = row.get(7).map_err(&err)?;

    let campaign = if campaign_id.is_some() || campaign_name.is_some() {
        Some(Campaign {
            id: campaign_id,
            name: campaign_name,
        })
    } else {
        None
    };

    Ok(LedgerEntry {
        id: row.get(0).map_err(&err)?,
        conversation_id: parse_uuid(&conversation_id)?,
        direction: direction.parse::<Direction>().map_err(DatabaseError::Serialization)?,
        content: row.get(3).map_err(&err)?,
        sent_at: parse_datetime(&sent_at),
        campaign,
        inserted_at: parse_datetime(&inserted_at),
    })
}

fn row_to_draft(row: &libsql::Row) -> Result<Draft, DatabaseError> {
    let err = row_err("draft");
    let id: String = row.get(0).map_err(&err)?;
    let conversation_id: String = row.get(1).map_err(&err)?;
    let stage: String = row.get(3).map_err(&err)?;
    let status: String = row.get(5).map_err(&err)?;
    let cost: String = row.get(8).map_err(&err)?;
    let qa_json: Option<String> = row.get(9).ok();
    let created: String = row.get(10).map_err(&err)?;
    let updated: String = row.get(11).map_err(&err)?;

    let qa: Option<QaAnnotation> = match qa_json {
        Some(json) => Some(
            serde_json::from_str(&json)
                .map_err(|e| DatabaseError::Serialization(format!("qa_json for {id}: {e}")))?,
        ),
        None => None,
    };

    Ok(Draft {
        id: parse_uuid(&id)?,
        conversation_id: parse_uuid(&conversation_id)?,
        text: row.get(2).map_err(&err)?,
        stage: stage.parse::<FunnelStage>().map_err(DatabaseError::Serialization)?,
        stage_rationale: row.get(4).map_err(&err)?,
        status: status.parse::<DraftStatus>().map_err(DatabaseError::Serialization)?,
        guidance: row.get(6).ok(),
        model: row.get(7).ok(),
        cost_usd: cost.parse::<Decimal>().unwrap_or_default(),
        qa,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_retry_task(row: &libsql::Row) -> Result<RetryTask, DatabaseError> {
    let err = row_err("retry_task");
    let id: String = row.get(0).map_err(&err)?;
    let conversation_id: String = row.get(1).map_err(&err)?;
    let status: String = row.get(4).map_err(&err)?;
    let created: String = row.get(5).map_err(&err)?;
    let updated: String = row.get(6).map_err(&err)?;

    Ok(RetryTask {
        id: parse_uuid(&id)?,
        conversation_id: parse_uuid(&conversation_id)?,
        reason: row.get(2).map_err(&err)?,
        attempts: row.get(3).map_err(&err)?,
        status: if status == "open" {
            RetryStatus::Open
        } else {
            RetryStatus::Resolved
        },
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_resource(row: &libsql::Row) -> Result<ResourceDoc, DatabaseError> {
    let err = row_err("resource_doc");
    let id: String = row.get(0).map_err(&err)?;
    let stages_json: String = row.get(5).map_err(&err)?;
    let stages: Vec<FunnelStage> = serde_json::from_str(&stages_json)
        .map_err(|e| DatabaseError::Serialization(format!("stages_json for {id}: {e}")))?;

    Ok(ResourceDoc {
        id,
        title: row.get(1).map_err(&err)?,
        category: row.get(2).map_err(&err)?,
        content: row.get(3).map_err(&err)?,
        priority: row.get::<i64>(4).map_err(&err)? as i32,
        stages,
        is_active: row.get::<i64>(6).map_err(&err)? != 0,
    })
}

fn draft_params(draft: &Draft, status: DraftStatus) -> Result<Vec<libsql::Value>, DatabaseError> {
    let qa_json = match &draft.qa {
        Some(qa) => Some(
            serde_json::to_string(qa).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        ),
        None => None,
    };
    Ok(vec![
        draft.id.to_string().into(),
        draft.conversation_id.to_string().into(),
        draft.text.clone().into(),
        draft.stage.as_str().to_string().into(),
        draft.stage_rationale.clone().into(),
        status.as_str().to_string().into(),
        opt_text(draft.guidance.as_deref()),
        opt_text(draft.model.as_deref()),
        draft.cost_usd.to_string().into(),
        opt_text(qa_json.as_deref()),
        ts(&draft.created_at).into(),
        ts(&draft.updated_at).into(),
    ])
}

const INSERT_DRAFT: &str = "INSERT INTO drafts (id, conversation_id, text, stage, stage_rationale, status, guidance, model, cost_usd, qa_json, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn upsert_conversation(
        &self,
        external_id: &str,
        lead: &Lead,
        sender_id: Option<&str>,
    ) -> Result<Conversation, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let now = ts(&Utc::now());

        if let Some(mut existing) = self
            .query_conversation("external_id", external_id.to_string())
            .await?
        {
            existing.lead.refresh(lead);
            let lead_json = serde_json::to_string(&existing.lead)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            self.conn()
                .execute(
                    "UPDATE conversations SET lead_json = ?1, sender_id = COALESCE(?2, sender_id), updated_at = ?3 WHERE id = ?4",
                    params![lead_json, opt_text(sender_id), now, existing.id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("upsert_conversation: {e}")))?;
            if let Some(sender) = sender_id {
                existing.sender_id = Some(sender.to_string());
            }
            return Ok(existing);
        }

        let id = Uuid::new_v4();
        let lead_json =
            serde_json::to_string(lead).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO conversations (id, external_id, lead_json, sender_id, funnel_stage, transcript_json, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, '[]', ?6, ?6)",
                params![
                    id.to_string(),
                    external_id,
                    lead_json,
                    opt_text(sender_id),
                    FunnelStage::default().as_str(),
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_conversation insert: {e}")))?;

        info!(conversation_id = %id, external_id, "Conversation created");
        self.query_conversation("id", id.to_string())
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "conversation".into(),
                id: id.to_string(),
            })
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        self.query_conversation("id", id.to_string()).await
    }

    async fn get_conversation_by_external(
        &self,
        external_id: &str,
    ) -> Result<Option<Conversation>, DatabaseError> {
        self.query_conversation("external_id", external_id.to_string()).await
    }

    async fn list_conversation_ids(&self) -> Result<Vec<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM conversations WHERE archived = 0 ORDER BY created_at ASC, id ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_conversation_ids: {e}")))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row.get(0).map_err(row_err("list_conversation_ids"))?;
            ids.push(parse_uuid(&id)?);
        }
        Ok(ids)
    }

    async fn save_transcript(
        &self,
        id: Uuid,
        transcript: &[TranscriptEntry],
        needs_review: bool,
    ) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(transcript)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE conversations SET transcript_json = ?1, needs_review = ?2, updated_at = ?3 WHERE id = ?4",
                params![json, needs_review as i64, ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_transcript: {e}")))?;
        debug!(conversation_id = %id, entries = transcript.len(), "Transcript saved");
        Ok(())
    }

    async fn flag_for_review(&self, id: Uuid) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE conversations SET needs_review = 1, updated_at = ?1 WHERE id = ?2",
                params![ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("flag_for_review: {e}")))?;
        Ok(())
    }

    async fn set_stage(&self, id: Uuid, stage: FunnelStage) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE conversations SET funnel_stage = ?1, updated_at = ?2 WHERE id = ?3",
                params![stage.as_str(), ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_stage: {e}")))?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn bump_generation(&self, id: Uuid) -> Result<i64, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                "UPDATE conversations SET generation_seq = generation_seq + 1 WHERE id = ?1 RETURNING generation_seq",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("bump_generation: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => row.get(0).map_err(row_err("bump_generation")),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                id: id.to_string(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("bump_generation: {e}"))),
        }
    }

    // ── Ledger ──────────────────────────────────────────────────────

    async fn insert_ledger_entry(
        &self,
        conversation_id: Uuid,
        message: &CanonicalMessage,
    ) -> Result<Option<LedgerEntry>, DatabaseError> {
        let inserted_at = Utc::now();
        let (campaign_id, campaign_name) = match &message.campaign {
            Some(c) => (c.id.as_deref(), c.name.as_deref()),
            None => (None, None),
        };

        let _guard = self.write_lock.lock().await;
        // The unique key does the dedup; a conflict returns no row.
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO ledger_entries (conversation_id, direction, content, content_key, sent_at, sent_at_ms, sent_minute, campaign_id, campaign_name, inserted_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT (conversation_id, direction, content_key, sent_minute) DO NOTHING \
                 RETURNING id",
                params![
                    conversation_id.to_string(),
                    message.direction.as_str(),
                    message.content.clone(),
                    message.content_key(),
                    ts(&message.sent_at),
                    message.sent_at.timestamp_millis(),
                    message.sent_minute(),
                    opt_text(campaign_id),
                    opt_text(campaign_name),
                    ts(&inserted_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_ledger_entry: {e}")))?;

        let id: i64 = match rows.next().await {
            Ok(Some(row)) => row.get(0).map_err(row_err("insert_ledger_entry"))?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("insert_ledger_entry: {e}"))),
        };
        drop(rows);

        self.conn()
            .execute(
                "UPDATE conversations SET last_message_at = ?1 WHERE id = ?2 AND (last_message_at IS NULL OR last_message_at < ?1)",
                params![ts(&message.sent_at), conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_ledger_entry last_message_at: {e}")))?;

        Ok(Some(LedgerEntry {
            id,
            conversation_id,
            direction: message.direction,
            content: message.content.clone(),
            sent_at: message.sent_at,
            campaign: message.campaign.clone(),
            inserted_at,
        }))
    }

    async fn ledger_entries(&self, conversation_id: Uuid) -> Result<Vec<LedgerEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LEDGER_COLUMNS} FROM ledger_entries WHERE conversation_id = ?1 ORDER BY sent_at_ms ASC, id ASC"
                ),
                params![conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ledger_entries: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            entries.push(row_to_ledger_entry(&row)?);
        }
        Ok(entries)
    }

    // ── Drafts ──────────────────────────────────────────────────────

    async fn commit_draft(&self, draft: &Draft, expected_seq: i64) -> Result<CommitOutcome, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_draft begin: {e}")))?;

        let mut rows = tx
            .query(
                "SELECT generation_seq FROM conversations WHERE id = ?1",
                params![draft.conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_draft seq: {e}")))?;
        let current_seq: i64 = match rows.next().await {
            Ok(Some(row)) => row.get(0).map_err(row_err("commit_draft"))?,
            Ok(None) => {
                return Err(DatabaseError::NotFound {
                    entity: "conversation".into(),
                    id: draft.conversation_id.to_string(),
                });
            }
            Err(e) => return Err(DatabaseError::Query(format!("commit_draft seq: {e}"))),
        };
        drop(rows);

        if current_seq != expected_seq {
            tx.execute(INSERT_DRAFT, draft_params(draft, DraftStatus::Superseded)?)
                .await
                .map_err(|e| DatabaseError::Query(format!("commit_draft stale insert: {e}")))?;
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("commit_draft commit: {e}")))?;
            return Ok(CommitOutcome::Stale { current_seq });
        }

        let now = ts(&Utc::now());
        let mut rows = tx
            .query(
                "UPDATE drafts SET status = 'superseded', updated_at = ?1 WHERE conversation_id = ?2 AND status = 'pending' RETURNING id",
                params![now.clone(), draft.conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_draft supersede: {e}")))?;
        let superseded = match rows.next().await {
            Ok(Some(row)) => {
                let id: String = row.get(0).map_err(row_err("commit_draft"))?;
                Some(parse_uuid(&id)?)
            }
            Ok(None) => None,
            Err(e) => return Err(DatabaseError::Query(format!("commit_draft supersede: {e}"))),
        };
        drop(rows);

        tx.execute(INSERT_DRAFT, draft_params(draft, DraftStatus::Pending)?)
            .await
            .map_err(|e| DatabaseError::Constraint(format!("commit_draft insert: {e}")))?;
        tx.execute(
            "UPDATE conversations SET funnel_stage = ?1, updated_at = ?2 WHERE id = ?3",
            params![draft.stage.as_str(), now, draft.conversation_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("commit_draft stage: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_draft commit: {e}")))?;

        debug!(draft_id = %draft.id, superseded = ?superseded, "Draft committed");
        Ok(CommitOutcome::Committed { superseded })
    }

    async fn get_draft(&self, id: Uuid) -> Result<Option<Draft>, DatabaseError> {
        let drafts = self
            .query_drafts(
                &format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE id = ?1"),
                vec![id.to_string().into()],
            )
            .await?;
        Ok(drafts.into_iter().next())
    }

    async fn pending_draft(&self, conversation_id: Uuid) -> Result<Option<Draft>, DatabaseError> {
        let drafts = self
            .query_drafts(
                &format!(
                    "SELECT {DRAFT_COLUMNS} FROM drafts WHERE conversation_id = ?1 AND status = 'pending'"
                ),
                vec![conversation_id.to_string().into()],
            )
            .await?;
        Ok(drafts.into_iter().next())
    }

    async fn list_pending_drafts(&self) -> Result<Vec<Draft>, DatabaseError> {
        self.query_drafts(
            &format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE status = 'pending' ORDER BY created_at DESC"),
            vec![],
        )
        .await
    }

    async fn drafts_for_conversation(&self, conversation_id: Uuid) -> Result<Vec<Draft>, DatabaseError> {
        self.query_drafts(
            &format!(
                "SELECT {DRAFT_COLUMNS} FROM drafts WHERE conversation_id = ?1 ORDER BY created_at ASC"
            ),
            vec![conversation_id.to_string().into()],
        )
        .await
    }

    async fn transition_draft(&self, id: Uuid, to: DraftStatus) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE drafts SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'pending'",
                params![to.as_str(), ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_draft: {e}")))?;
        debug!(draft_id = %id, status = %to, changed = affected > 0, "Draft transition");
        Ok(affected > 0)
    }

    async fn expire_stale_drafts(&self, older_than: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE drafts SET status = 'expired', updated_at = ?1 WHERE status = 'pending' AND created_at < ?2",
                params![ts(&Utc::now()), ts(&older_than)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("expire_stale_drafts: {e}")))?;
        Ok(affected as usize)
    }

    // ── Retry tasks ─────────────────────────────────────────────────

    async fn record_retry_task(&self, conversation_id: Uuid, reason: &str) -> Result<Uuid, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let now = ts(&Utc::now());

        let mut rows = self
            .conn()
            .query(
                "UPDATE retry_tasks SET attempts = attempts + 1, reason = ?1, updated_at = ?2 WHERE conversation_id = ?3 AND status = 'open' RETURNING id",
                params![reason, now.clone(), conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_retry_task: {e}")))?;
        if let Ok(Some(row)) = rows.next().await {
            let id: String = row.get(0).map_err(row_err("record_retry_task"))?;
            return parse_uuid(&id);
        }
        drop(rows);

        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO retry_tasks (id, conversation_id, reason, attempts, status, created_at, updated_at) VALUES (?1, ?2, ?3, 1, 'open', ?4, ?4)",
                params![id.to_string(), conversation_id.to_string(), reason, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_retry_task insert: {e}")))?;
        Ok(id)
    }

    async fn open_retry_tasks(&self) -> Result<Vec<RetryTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RETRY_COLUMNS} FROM retry_tasks WHERE status = 'open' ORDER BY created_at ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("open_retry_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_retry_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Skipping retry task row: {e}"),
            }
        }
        Ok(tasks)
    }

    async fn resolve_retry_tasks(&self, conversation_id: Uuid) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE retry_tasks SET status = 'resolved', updated_at = ?1 WHERE conversation_id = ?2 AND status = 'open'",
                params![ts(&Utc::now()), conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_retry_tasks: {e}")))?;
        Ok(affected as usize)
    }

    // ── Resources ───────────────────────────────────────────────────

    async fn upsert_resource(&self, doc: &ResourceDoc) -> Result<(), DatabaseError> {
        let stages_json = serde_json::to_string(&doc.stages)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO resource_docs (id, title, category, content, priority, stages_json, is_active, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT (id) DO UPDATE SET title = excluded.title, category = excluded.category, \
                 content = excluded.content, priority = excluded.priority, stages_json = excluded.stages_json, \
                 is_active = excluded.is_active, updated_at = excluded.updated_at",
                params![
                    doc.id.clone(),
                    doc.title.clone(),
                    doc.category.clone(),
                    doc.content.clone(),
                    doc.priority as i64,
                    stages_json,
                    doc.is_active as i64,
                    ts(&Utc::now())
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_resource: {e}")))?;
        Ok(())
    }

    async fn resources_for_stage(&self, stage: FunnelStage) -> Result<Vec<ResourceDoc>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RESOURCE_COLUMNS} FROM resource_docs \
                     WHERE is_active = 1 AND EXISTS (SELECT 1 FROM json_each(resource_docs.stages_json) WHERE json_each.value = ?1) \
                     ORDER BY priority DESC, id ASC"
                ),
                params![stage.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resources_for_stage: {e}")))?;

        let mut docs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_resource(&row) {
                Ok(doc) => docs.push(doc),
                Err(e) => warn!("Skipping resource row: {e}"),
            }
        }
        Ok(docs)
    }
}
