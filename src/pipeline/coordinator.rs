//! Pipeline coordinator.
//!
//! Per event: ledger append, transcript reprojection, stage classification,
//! context assembly, generation, draft commit, review notification.
//!
//! The conversation lock covers the ledger append, reprojection and the
//! generation-sequence bump only. Classification and generation run after it
//! is released, so a slow model call never blocks newer messages for the same
//! conversation. A result whose sequence number is no longer current is
//! stored as superseded and never shown.

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::{AssemblyInput, ContextAssembler, ResourceDoc, ResourceLibrary};
use crate::conversation::{Conversation, Lead};
use crate::drafts::{Draft, DraftGenerator, DraftNotification, DraftStatus, ReviewEvent, ReviewSurface};
use crate::error::{DatabaseError, PipelineError};
use crate::ingest::WebhookEvent;
use crate::ledger::{LedgerEntry, MessageLedger};
use crate::pipeline::locks::{ConversationGuard, ConversationLocks};
use crate::stage::{FunnelStage, StageClassification, StageClassifier, StageSource};
use crate::store::{CommitOutcome, Database, RetryTask};
use crate::transcript::{BackfillReport, Reconciliation, TranscriptEntry, TranscriptRole, reconcile};

/// Which webhook delivered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookKind {
    /// The lead replied. New inbound messages trigger a draft.
    Inbound,
    /// The operator side sent something. Recorded for completeness only.
    Outbound,
}

/// Result of one generation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GenerationOutcome {
    Drafted {
        draft_id: Uuid,
        stage: FunnelStage,
        superseded: Option<Uuid>,
    },
    /// Generation failed; a retry task is open.
    Failed { retry_task_id: Uuid, reason: String },
    /// A newer generation started while this one ran.
    Stale { draft_id: Uuid },
}

/// Result of handling one webhook event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Every message in the window was already recorded.
    Duplicate,
    /// New messages recorded; nothing to draft.
    Recorded { inserted: usize },
    /// The transcript disagrees with the ledger beyond repair; drafting waits for a human.
    NeedsReview { inserted: usize },
    Generated(GenerationOutcome),
}

/// Counts from a retry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub attempted: usize,
    pub drafted: usize,
    pub failed: usize,
    pub stale: usize,
    pub skipped: usize,
}

/// Everything known about one conversation, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationDetail {
    pub conversation: Conversation,
    pub ledger: Vec<LedgerEntry>,
    pub drafts: Vec<Draft>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Pending drafts older than this are expired by the sweep.
    pub draft_stale_after: Duration,
    /// How many retry tasks run at once.
    pub retry_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            draft_stale_after: Duration::hours(48),
            retry_concurrency: 4,
        }
    }
}

/// Input to the unlocked generation phase, captured while the lock was held.
struct GenerationJob {
    conversation_id: Uuid,
    lead: Lead,
    transcript: Vec<TranscriptEntry>,
    previous_stage: FunnelStage,
    seq: i64,
    /// Set for regeneration: keep this stage instead of reclassifying.
    fixed_stage: Option<StageClassification>,
    guidance: Option<String>,
}

pub struct PipelineCoordinator {
    db: Arc<dyn Database>,
    ledger: MessageLedger,
    locks: ConversationLocks,
    classifier: StageClassifier,
    assembler: ContextAssembler,
    library: Arc<dyn ResourceLibrary>,
    generator: DraftGenerator,
    review: Arc<dyn ReviewSurface>,
    config: PipelineConfig,
}

impl PipelineCoordinator {
    pub fn new(
        db: Arc<dyn Database>,
        classifier: StageClassifier,
        assembler: ContextAssembler,
        library: Arc<dyn ResourceLibrary>,
        generator: DraftGenerator,
        review: Arc<dyn ReviewSurface>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            ledger: MessageLedger::new(db.clone()),
            db,
            locks: ConversationLocks::new(),
            classifier,
            assembler,
            library,
            generator,
            review,
            config,
        }
    }

    /// Handle one normalized webhook event.
    ///
    /// Ledger appends are never rolled back. Any failure after them opens a
    /// retry task for the conversation, so a redelivery that dedups to
    /// nothing still leaves the reply reachable by `retry_failed`.
    pub async fn handle_event(
        &self,
        kind: WebhookKind,
        event: WebhookEvent,
    ) -> Result<IngestOutcome, PipelineError> {
        let guard = self.locks.acquire(&event.external_conversation_id).await;

        let conversation = self
            .db
            .upsert_conversation(
                &event.external_conversation_id,
                &event.lead,
                event.sender_id.as_deref(),
            )
            .await?;
        let recorded = self.ledger.record_all(conversation.id, &event.messages).await?;
        info!(
            conversation_id = %conversation.id,
            kind = ?kind,
            inserted = recorded.inserted,
            duplicates = recorded.duplicates,
            unattributed = event.unattributed,
            "Webhook window recorded"
        );
        if recorded.inserted == 0 {
            return Ok(IngestOutcome::Duplicate);
        }

        let conversation_id = conversation.id;
        let result = self
            .after_append(kind, conversation, recorded.inserted, recorded.inbound_inserted, guard)
            .await;
        if let Err(e) = &result {
            self.open_retry(conversation_id, e).await;
        }
        result
    }

    /// Replace a pending draft with a fresh one for the same stage, carrying
    /// the full lead profile and the reviewer's reason as guidance.
    pub async fn regenerate(
        &self,
        draft_id: Uuid,
        reason: Option<String>,
    ) -> Result<GenerationOutcome, PipelineError> {
        let draft = self.pending(draft_id).await?;
        let conversation = self.conversation(draft.conversation_id).await?;

        let guard = self.locks.acquire(&conversation.external_id).await;
        // Re-read under the lock; a newer draft may have replaced this one.
        let draft = self.pending(draft_id).await?;
        let conversation = self.conversation(conversation.id).await?;
        if !has_lead_message(&conversation.transcript) {
            return Err(PipelineError::NothingToReply(conversation.external_id));
        }
        let seq = self.db.bump_generation(conversation.id).await?;
        drop(guard);

        info!(
            draft_id = %draft.id,
            conversation_id = %conversation.id,
            stage = %draft.stage,
            "Regenerating draft"
        );
        let guidance = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        let job = GenerationJob {
            conversation_id: conversation.id,
            lead: conversation.lead,
            transcript: conversation.transcript,
            previous_stage: conversation.funnel_stage,
            seq,
            fixed_stage: Some(StageClassification {
                stage: draft.stage,
                rationale: draft.stage_rationale,
                source: StageSource::Reused,
            }),
            guidance,
        };
        self.generate(job).await
    }

    pub async fn approve(&self, draft_id: Uuid) -> Result<Draft, PipelineError> {
        self.decide(draft_id, DraftStatus::Approved).await
    }

    pub async fn reject(&self, draft_id: Uuid) -> Result<Draft, PipelineError> {
        self.decide(draft_id, DraftStatus::Rejected).await
    }

    /// Reconcile every conversation's cached transcript with its ledger.
    /// Safe to re-run: a second pass reports everything as already correct.
    pub async fn backfill(&self) -> Result<BackfillReport, PipelineError> {
        let mut report = BackfillReport::default();
        for id in self.db.list_conversation_ids().await? {
            let Some(summary) = self.db.get_conversation(id).await? else {
                continue;
            };
            let _guard = self.locks.acquire(&summary.external_id).await;
            let conversation = self.conversation(id).await?;
            let (outcome, _) = self.reproject(&conversation).await?;
            report.tally(&outcome);
        }
        info!(
            total = report.total,
            patched = report.patched,
            rebuilt = report.rebuilt,
            skipped = report.skipped,
            flagged = report.flagged,
            "Transcript backfill complete"
        );
        Ok(report)
    }

    /// Re-run generation for every open retry task.
    pub async fn retry_failed(&self) -> Result<RetryReport, PipelineError> {
        let tasks = self.db.open_retry_tasks().await?;
        let concurrency = self.config.retry_concurrency.max(1);
        let results: Vec<Result<Option<GenerationOutcome>, PipelineError>> =
            futures::stream::iter(tasks)
                .map(|task| self.retry_one(task))
                .buffer_unordered(concurrency)
                .collect()
                .await;

        let mut report = RetryReport::default();
        for result in results {
            report.attempted += 1;
            match result {
                Ok(Some(GenerationOutcome::Drafted { .. })) => report.drafted += 1,
                Ok(Some(GenerationOutcome::Failed { .. })) => report.failed += 1,
                Ok(Some(GenerationOutcome::Stale { .. })) => report.stale += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!(error = %e, "Retry task errored");
                    report.failed += 1;
                }
            }
        }
        info!(?report, "Retry sweep complete");
        Ok(report)
    }

    /// Expire pending drafts older than the configured age.
    pub async fn expire_stale(&self) -> Result<usize, PipelineError> {
        let cutoff = Utc::now() - self.config.draft_stale_after;
        let expired = self.db.expire_stale_drafts(cutoff).await?;
        if expired > 0 {
            info!(expired, "Stale drafts expired");
        }
        Ok(expired)
    }

    /// Administrative stage override.
    pub async fn override_stage(
        &self,
        external_id: &str,
        stage: FunnelStage,
    ) -> Result<Conversation, PipelineError> {
        let _guard = self.locks.acquire(external_id).await;
        let conversation = self.conversation_by_external(external_id).await?;
        self.db.set_stage(conversation.id, stage).await?;
        info!(
            conversation_id = %conversation.id,
            from = %conversation.funnel_stage,
            to = %stage,
            "Stage overridden"
        );
        self.conversation(conversation.id).await
    }

    pub async fn conversation_detail(&self, external_id: &str) -> Result<ConversationDetail, PipelineError> {
        let conversation = self.conversation_by_external(external_id).await?;
        let ledger = self.ledger.entries(conversation.id).await?;
        let drafts = self.db.drafts_for_conversation(conversation.id).await?;
        Ok(ConversationDetail {
            conversation,
            ledger,
            drafts,
        })
    }

    pub async fn pending_drafts(&self) -> Result<Vec<Draft>, PipelineError> {
        Ok(self.db.list_pending_drafts().await?)
    }

    pub async fn upsert_resource(&self, doc: &ResourceDoc) -> Result<(), PipelineError> {
        Ok(self.db.upsert_resource(doc).await?)
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Everything downstream of a ledger append that inserted rows.
    async fn after_append(
        &self,
        kind: WebhookKind,
        conversation: Conversation,
        inserted: usize,
        inbound_inserted: usize,
        guard: ConversationGuard<'_>,
    ) -> Result<IngestOutcome, PipelineError> {
        let (reconciliation, transcript) = self.reproject(&conversation).await?;
        if matches!(reconciliation, Reconciliation::NeedsReview { .. }) {
            return Ok(IngestOutcome::NeedsReview { inserted });
        }
        if kind == WebhookKind::Outbound || inbound_inserted == 0 {
            return Ok(IngestOutcome::Recorded { inserted });
        }

        let seq = self.db.bump_generation(conversation.id).await?;
        drop(guard);

        let job = GenerationJob {
            conversation_id: conversation.id,
            lead: conversation.lead,
            transcript,
            previous_stage: conversation.funnel_stage,
            seq,
            fixed_stage: None,
            guidance: None,
        };
        Ok(IngestOutcome::Generated(self.generate(job).await?))
    }

    /// Open (or bump) the retry task after a failure that followed a ledger append.
    async fn open_retry(&self, conversation_id: Uuid, err: &PipelineError) {
        let reason = err.to_string();
        match self.db.record_retry_task(conversation_id, &reason).await {
            Ok(task_id) => warn!(
                %conversation_id,
                %task_id,
                error = %reason,
                "Processing failed after ledger append, retry task opened"
            ),
            Err(e) => error!(
                %conversation_id,
                error = %reason,
                retry_error = %e,
                "Processing failed after ledger append and the retry task could not be recorded"
            ),
        }
    }

    /// Bring the cached transcript in line with the ledger and persist the
    /// result. Returns the outcome and the transcript generation should use.
    async fn reproject(
        &self,
        conversation: &Conversation,
    ) -> Result<(Reconciliation, Vec<TranscriptEntry>), DatabaseError> {
        if conversation.transcript_unreadable {
            warn!(conversation_id = %conversation.id, "Cached transcript unreadable, flagged for manual review");
            if !conversation.needs_review {
                self.db.flag_for_review(conversation.id).await?;
            }
            let reason = "cached transcript is unreadable";
            return Ok((Reconciliation::NeedsReview { reason }, Vec::new()));
        }

        let entries = self.ledger.entries(conversation.id).await?;
        let outcome = reconcile(&conversation.transcript, &entries);

        let transcript = match &outcome {
            Reconciliation::Patched { transcript, relabeled } => {
                info!(conversation_id = %conversation.id, relabeled, "Transcript roles patched");
                self.db.save_transcript(conversation.id, transcript, false).await?;
                transcript.clone()
            }
            Reconciliation::Rebuilt { transcript, reason } => {
                debug!(conversation_id = %conversation.id, reason = ?reason, "Transcript rebuilt from ledger");
                self.db.save_transcript(conversation.id, transcript, false).await?;
                transcript.clone()
            }
            Reconciliation::NeedsReview { reason } => {
                warn!(conversation_id = %conversation.id, reason, "Transcript flagged for manual review");
                if !conversation.needs_review {
                    self.db.flag_for_review(conversation.id).await?;
                }
                conversation.transcript.clone()
            }
            Reconciliation::Unchanged => {
                if conversation.needs_review {
                    self.db
                        .save_transcript(conversation.id, &conversation.transcript, false)
                        .await?;
                }
                conversation.transcript.clone()
            }
            Reconciliation::Skipped => conversation.transcript.clone(),
        };
        Ok((outcome, transcript))
    }

    /// The unlocked phase: classify, assemble, generate, commit, notify.
    async fn generate(&self, job: GenerationJob) -> Result<GenerationOutcome, PipelineError> {
        let classification = match job.fixed_stage {
            Some(fixed) => fixed,
            None => {
                self.classifier
                    .classify(&job.transcript, &job.lead, job.previous_stage)
                    .await
            }
        };
        debug!(
            conversation_id = %job.conversation_id,
            stage = %classification.stage,
            source = ?classification.source,
            "Stage decided"
        );

        let resources = match self.library.fetch_for_stage(classification.stage).await {
            Ok(docs) => docs,
            Err(e) => {
                warn!(error = %e, stage = %classification.stage, "Resource lookup failed, assembling without snippets");
                Vec::new()
            }
        };
        let context = self.assembler.assemble(
            AssemblyInput {
                transcript: &job.transcript,
                lead: &job.lead,
                stage: classification.stage,
                guidance: job.guidance.as_deref(),
            },
            resources,
        );

        let reply = match self.generator.generate(&context).await {
            Ok(reply) => reply,
            Err(e) => {
                let reason = e.to_string();
                warn!(conversation_id = %job.conversation_id, error = %reason, "Draft generation failed");
                let retry_task_id = self.db.record_retry_task(job.conversation_id, &reason).await?;
                self.notify(&ReviewEvent::GenerationFailed {
                    conversation_id: job.conversation_id,
                    lead_name: job.lead.full_name.clone(),
                    reason: reason.clone(),
                    retry_task_id,
                })
                .await;
                return Ok(GenerationOutcome::Failed {
                    retry_task_id,
                    reason,
                });
            }
        };

        let draft = Draft::pending(
            job.conversation_id,
            &reply,
            &classification,
            job.guidance.as_deref(),
        );
        match self.db.commit_draft(&draft, job.seq).await? {
            CommitOutcome::Committed { superseded } => {
                self.db.resolve_retry_tasks(job.conversation_id).await?;
                info!(
                    draft_id = %draft.id,
                    conversation_id = %job.conversation_id,
                    stage = %draft.stage,
                    cost_usd = %draft.cost_usd,
                    superseded = ?superseded,
                    "Draft created"
                );
                self.notify(&ReviewEvent::DraftCreated(DraftNotification {
                    draft_id: draft.id,
                    conversation_id: job.conversation_id,
                    lead_name: job.lead.full_name.clone(),
                    lead_title: job.lead.title.clone(),
                    lead_company: job.lead.company.clone(),
                    stage: draft.stage.to_string(),
                    stage_rationale: classification.rationale.clone(),
                    stage_source: classification.source,
                    draft_text: draft.text.clone(),
                    recent_messages: DraftNotification::tail(&job.transcript),
                    supersedes: superseded,
                }))
                .await;
                Ok(GenerationOutcome::Drafted {
                    draft_id: draft.id,
                    stage: draft.stage,
                    superseded,
                })
            }
            CommitOutcome::Stale { current_seq } => {
                warn!(
                    draft_id = %draft.id,
                    conversation_id = %job.conversation_id,
                    seq = job.seq,
                    current_seq,
                    "Discarding stale generation result"
                );
                Ok(GenerationOutcome::Stale { draft_id: draft.id })
            }
        }
    }

    async fn retry_one(&self, task: RetryTask) -> Result<Option<GenerationOutcome>, PipelineError> {
        let conversation = self.conversation(task.conversation_id).await?;
        let guard = self.locks.acquire(&conversation.external_id).await;
        let conversation = self.conversation(task.conversation_id).await?;
        let (outcome, transcript) = self.reproject(&conversation).await?;
        if matches!(outcome, Reconciliation::NeedsReview { .. }) || !has_lead_message(&transcript) {
            debug!(task_id = %task.id, "Retry task has nothing to draft, closing");
            self.db.resolve_retry_tasks(conversation.id).await?;
            return Ok(None);
        }
        let seq = self.db.bump_generation(conversation.id).await?;
        drop(guard);

        info!(task_id = %task.id, attempts = task.attempts, conversation_id = %conversation.id, "Retrying draft generation");
        let job = GenerationJob {
            conversation_id: conversation.id,
            lead: conversation.lead,
            transcript,
            previous_stage: conversation.funnel_stage,
            seq,
            fixed_stage: None,
            guidance: None,
        };
        self.generate(job).await.map(Some)
    }

    async fn decide(&self, draft_id: Uuid, to: DraftStatus) -> Result<Draft, PipelineError> {
        let draft = self.pending(draft_id).await?;
        if !self.db.transition_draft(draft.id, to).await? {
            let current = self.draft(draft_id).await?;
            return Err(PipelineError::DraftNotPending {
                id: draft_id.to_string(),
                status: current.status.to_string(),
            });
        }
        info!(draft_id = %draft.id, conversation_id = %draft.conversation_id, status = %to, "Draft decided");
        self.draft(draft_id).await
    }

    async fn notify(&self, event: &ReviewEvent) {
        if let Err(e) = self.review.notify(event).await {
            warn!(error = %e, "Review notification failed");
        }
    }

    async fn draft(&self, id: Uuid) -> Result<Draft, PipelineError> {
        self.db
            .get_draft(id)
            .await?
            .ok_or_else(|| PipelineError::DraftNotFound(id.to_string()))
    }

    async fn pending(&self, id: Uuid) -> Result<Draft, PipelineError> {
        let draft = self.draft(id).await?;
        if draft.status != DraftStatus::Pending {
            return Err(PipelineError::DraftNotPending {
                id: id.to_string(),
                status: draft.status.to_string(),
            });
        }
        Ok(draft)
    }

    async fn conversation(&self, id: Uuid) -> Result<Conversation, PipelineError> {
        self.db
            .get_conversation(id)
            .await?
            .ok_or_else(|| PipelineError::ConversationNotFound(id.to_string()))
    }

    async fn conversation_by_external(&self, external_id: &str) -> Result<Conversation, PipelineError> {
        self.db
            .get_conversation_by_external(external_id)
            .await?
            .ok_or_else(|| PipelineError::ConversationNotFound(external_id.to_string()))
    }
}

fn has_lead_message(transcript: &[TranscriptEntry]) -> bool {
    transcript.iter().any(|e| e.role == TranscriptRole::Lead)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::context::{AssemblerConfig, DbResourceLibrary, StageTemplates};
    use crate::drafts::LogReviewSurface;
    use crate::error::{LlmError, ReviewError};
    use crate::ingest::normalize;
    use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role};
    use crate::stage::ClassifierConfig;
    use crate::store::LibSqlBackend;

    /// Answers classification prompts with a fixed stage and draft prompts
    /// from a script; an exhausted script answers with a default reply.
    /// Draft prompts are recorded. A gated draft call parks until released.
    struct ScriptedLlm {
        stage: &'static str,
        drafts: Mutex<VecDeque<Result<String, LlmError>>>,
        draft_prompts: Mutex<Vec<String>>,
        gate: Mutex<Option<Arc<Notify>>>,
        parked: Notify,
    }

    impl ScriptedLlm {
        fn new(stage: &'static str, drafts: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                stage,
                drafts: Mutex::new(drafts.into()),
                draft_prompts: Mutex::new(Vec::new()),
                gate: Mutex::new(None),
                parked: Notify::new(),
            })
        }

        /// The next draft call waits on `gate`.
        fn hold_next_draft(&self, gate: Arc<Notify>) {
            *self.gate.lock().unwrap() = Some(gate);
        }

        fn draft_calls(&self) -> usize {
            self.draft_prompts.lock().unwrap().len()
        }

        fn last_draft_prompt(&self) -> String {
            self.draft_prompts.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (dec!(0.000003), dec!(0.000015))
        }
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            let system = request.system_prompt().unwrap_or_default();
            let content = if system.contains("funnel stage") {
                json!({"stage": self.stage, "rationale": "scripted"}).to_string()
            } else {
                let user = request
                    .messages
                    .iter()
                    .filter(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                self.draft_prompts.lock().unwrap().push(user);
                let next = self.drafts.lock().unwrap().pop_front();
                let gate = self.gate.lock().unwrap().take();
                if let Some(gate) = gate {
                    self.parked.notify_one();
                    gate.notified().await;
                }
                match next {
                    Some(next) => next?,
                    None => json!({"reply": "Happy to set up a call."}).to_string(),
                }
            };
            Ok(CompletionResponse {
                content,
                input_tokens: 200,
                output_tokens: 40,
                finish_reason: FinishReason::Stop,
                response_id: None,
            })
        }
    }

    /// Captures review events.
    #[derive(Default)]
    struct RecordingReview {
        events: Mutex<Vec<ReviewEvent>>,
    }

    #[async_trait]
    impl ReviewSurface for RecordingReview {
        async fn notify(&self, event: &ReviewEvent) -> Result<(), ReviewError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Harness {
        db: Arc<dyn Database>,
        backend: Arc<LibSqlBackend>,
        pipeline: PipelineCoordinator,
        review: Arc<RecordingReview>,
    }

    async fn harness(llm: Arc<ScriptedLlm>) -> Harness {
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let db: Arc<dyn Database> = backend.clone();
        let review = Arc::new(RecordingReview::default());
        let pipeline = PipelineCoordinator::new(
            db.clone(),
            StageClassifier::new(llm.clone(), ClassifierConfig::default()),
            ContextAssembler::new(Arc::new(StageTemplates::builtin()), AssemblerConfig::default()),
            Arc::new(DbResourceLibrary::new(db.clone())),
            DraftGenerator::new(llm),
            review.clone(),
            PipelineConfig::default(),
        );
        Harness {
            db,
            backend,
            pipeline,
            review,
        }
    }

    fn inbound_event(reply: &str, at: &str) -> WebhookEvent {
        normalize(json!({
            "body": {
                "conversation_id": "conv-42",
                "lead": {"full_name": "Dana Reyes", "company_name": "Acme", "position": "VP Sales"},
                "sender": {"id": 7},
                "recent_messages": [
                    {"creation_time": "2026-01-28T09:00:00Z", "message": "Hi Dana, saw your post on RevOps", "is_reply": false},
                    {"creation_time": at, "message": reply, "is_reply": true}
                ]
            }
        }))
        .unwrap()
    }

    fn drafted_id(outcome: &IngestOutcome) -> Uuid {
        match outcome {
            IngestOutcome::Generated(GenerationOutcome::Drafted { draft_id, .. }) => *draft_id,
            other => panic!("expected a draft, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_event_produces_pending_draft() {
        let llm = ScriptedLlm::new("pitched", vec![]);
        let h = harness(llm).await;

        let outcome = h
            .pipeline
            .handle_event(WebhookKind::Inbound, inbound_event("Sure, tell me more", "2026-01-28T10:00:00Z"))
            .await
            .unwrap();
        let draft_id = drafted_id(&outcome);

        let draft = h.db.get_draft(draft_id).await.unwrap().unwrap();
        assert_eq!(draft.status, DraftStatus::Pending);
        assert_eq!(draft.text, "Happy to set up a call.");
        assert_eq!(draft.stage, FunnelStage::Pitched);

        let conv = h.db.get_conversation_by_external("conv-42").await.unwrap().unwrap();
        assert_eq!(conv.funnel_stage, FunnelStage::Pitched);
        assert_eq!(conv.transcript.len(), 2);
        assert_eq!(conv.transcript[0].role, TranscriptRole::Operator);
        assert_eq!(conv.transcript[1].role, TranscriptRole::Lead);

        let events = h.review.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ReviewEvent::DraftCreated(n) if n.draft_id == draft_id));
    }

    #[tokio::test]
    async fn redelivery_is_a_no_op() {
        let llm = ScriptedLlm::new("pitched", vec![]);
        let h = harness(llm.clone()).await;
        let event = inbound_event("Sure, tell me more", "2026-01-28T10:00:00Z");

        h.pipeline.handle_event(WebhookKind::Inbound, event.clone()).await.unwrap();
        let second = h.pipeline.handle_event(WebhookKind::Inbound, event).await.unwrap();
        assert_eq!(second, IngestOutcome::Duplicate);

        let conv = h.db.get_conversation_by_external("conv-42").await.unwrap().unwrap();
        assert_eq!(h.db.ledger_entries(conv.id).await.unwrap().len(), 2);
        assert_eq!(h.db.drafts_for_conversation(conv.id).await.unwrap().len(), 1);
        assert_eq!(llm.draft_calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_redelivery_drafts_at_most_once() {
        let llm = ScriptedLlm::new("positive_reply", vec![]);
        let h = Arc::new(harness(llm).await);
        let event = inbound_event("Interested!", "2026-01-28T10:00:00Z");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let h = h.clone();
            let event = event.clone();
            handles.push(tokio::spawn(async move {
                h.pipeline.handle_event(WebhookKind::Inbound, event).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let conv = h.db.get_conversation_by_external("conv-42").await.unwrap().unwrap();
        let drafts = h.db.drafts_for_conversation(conv.id).await.unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(h.db.ledger_entries(conv.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn outbound_webhook_only_records() {
        let llm = ScriptedLlm::new("pitched", vec![]);
        let h = harness(llm.clone()).await;
        let event = normalize(json!({
            "conversation_id": "conv-42",
            "lead": {"full_name": "Dana Reyes"},
            "campaign": {"id": 9, "name": "Q1"},
            "recent_messages": [
                {"creation_time": "2026-01-28T09:00:00Z", "message": "Hi Dana", "is_reply": false}
            ]
        }))
        .unwrap();

        let outcome = h.pipeline.handle_event(WebhookKind::Outbound, event).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Recorded { inserted: 1 });
        assert_eq!(llm.draft_calls(), 0);

        let detail = h.pipeline.conversation_detail("conv-42").await.unwrap();
        assert_eq!(detail.ledger[0].campaign.as_ref().unwrap().name.as_deref(), Some("Q1"));
    }

    #[tokio::test]
    async fn newer_message_supersedes_pending_draft() {
        let llm = ScriptedLlm::new("pitched", vec![]);
        let h = harness(llm).await;
        let first = drafted_id(
            &h.pipeline
                .handle_event(WebhookKind::Inbound, inbound_event("Sure", "2026-01-28T10:00:00Z"))
                .await
                .unwrap(),
        );
        let outcome = h
            .pipeline
            .handle_event(WebhookKind::Inbound, inbound_event("Actually, Tuesday?", "2026-01-28T10:30:00Z"))
            .await
            .unwrap();
        match outcome {
            IngestOutcome::Generated(GenerationOutcome::Drafted { superseded, .. }) => {
                assert_eq!(superseded, Some(first))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.pipeline.pending_drafts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn regenerate_supersedes_and_keeps_context() {
        let llm = ScriptedLlm::new(
            "calendar_sent",
            vec![
                Ok(json!({"reply": "Here is my calendar link."}).to_string()),
                Ok(json!({"reply": "Here is my link, Dana. Grab any slot."}).to_string()),
            ],
        );
        let h = harness(llm).await;
        let d1 = drafted_id(
            &h.pipeline
                .handle_event(WebhookKind::Inbound, inbound_event("Send times", "2026-01-28T10:00:00Z"))
                .await
                .unwrap(),
        );

        let outcome = h
            .pipeline
            .regenerate(d1, Some("use their first name".into()))
            .await
            .unwrap();
        let GenerationOutcome::Drafted { draft_id: d2, superseded, stage } = outcome else {
            panic!("expected a new draft");
        };
        assert_eq!(superseded, Some(d1));
        assert_eq!(stage, FunnelStage::CalendarSent);

        let old = h.db.get_draft(d1).await.unwrap().unwrap();
        let new = h.db.get_draft(d2).await.unwrap().unwrap();
        assert_eq!(old.status, DraftStatus::Superseded);
        assert_eq!(new.status, DraftStatus::Pending);
        assert_eq!(new.guidance.as_deref(), Some("use their first name"));
        assert_eq!(new.text, "Here is my link, Dana. Grab any slot.");
        assert_eq!(h.pipeline.pending_drafts().await.unwrap().len(), 1);

        // The superseded draft can no longer be regenerated or approved.
        assert!(matches!(
            h.pipeline.regenerate(d1, None).await,
            Err(PipelineError::DraftNotPending { .. })
        ));
        assert!(h.pipeline.approve(d1).await.is_err());
    }

    #[tokio::test]
    async fn failed_generation_keeps_ledger_and_opens_retry() {
        let llm = ScriptedLlm::new(
            "pitched",
            vec![Err(LlmError::Timeout {
                provider: "scripted".into(),
                after: std::time::Duration::from_secs(30),
            })],
        );
        let h = harness(llm).await;

        let outcome = h
            .pipeline
            .handle_event(WebhookKind::Inbound, inbound_event("Sure", "2026-01-28T10:00:00Z"))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Generated(GenerationOutcome::Failed { .. })));

        let conv = h.db.get_conversation_by_external("conv-42").await.unwrap().unwrap();
        assert_eq!(h.db.ledger_entries(conv.id).await.unwrap().len(), 2);
        assert!(h.db.pending_draft(conv.id).await.unwrap().is_none());
        assert_eq!(h.db.open_retry_tasks().await.unwrap().len(), 1);
        assert!(matches!(
            h.review.events.lock().unwrap().last(),
            Some(ReviewEvent::GenerationFailed { .. })
        ));

        let report = h.pipeline.retry_failed().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.drafted, 1);
        assert!(h.db.open_retry_tasks().await.unwrap().is_empty());
        assert!(h.db.pending_draft(conv.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unrecognized_stage_token_keeps_previous_stage() {
        let llm = ScriptedLlm::new("warm_lead", vec![]);
        let h = harness(llm).await;
        h.pipeline
            .handle_event(WebhookKind::Inbound, inbound_event("Sure", "2026-01-28T10:00:00Z"))
            .await
            .unwrap();
        h.pipeline.override_stage("conv-42", FunnelStage::Booked).await.unwrap();

        h.pipeline
            .handle_event(WebhookKind::Inbound, inbound_event("See you then", "2026-01-28T11:00:00Z"))
            .await
            .unwrap();
        let conv = h.db.get_conversation_by_external("conv-42").await.unwrap().unwrap();
        assert_eq!(conv.funnel_stage, FunnelStage::Booked);
    }

    #[tokio::test]
    async fn backfill_repairs_then_is_idempotent() {
        let llm = ScriptedLlm::new("pitched", vec![]);
        let h = harness(llm).await;
        h.pipeline
            .handle_event(WebhookKind::Inbound, inbound_event("Sure", "2026-01-28T10:00:00Z"))
            .await
            .unwrap();

        // Corrupt the cache: everything labelled lead.
        let conv = h.db.get_conversation_by_external("conv-42").await.unwrap().unwrap();
        let corrupted: Vec<TranscriptEntry> = conv
            .transcript
            .iter()
            .map(|e| TranscriptEntry {
                role: TranscriptRole::Lead,
                ..e.clone()
            })
            .collect();
        h.db.save_transcript(conv.id, &corrupted, false).await.unwrap();

        let first = h.pipeline.backfill().await.unwrap();
        assert_eq!(first.patched, 1);
        assert_eq!(first.total, 1);
        let repaired = h.db.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(repaired.transcript[0].role, TranscriptRole::Operator);

        let second = h.pipeline.backfill().await.unwrap();
        assert_eq!(second.already_correct, 1);
        assert_eq!(second.patched + second.rebuilt, 0);
    }

    #[tokio::test]
    async fn unmatched_history_is_flagged_not_cleared() {
        let llm = ScriptedLlm::new("pitched", vec![]);
        let h = harness(llm).await;
        h.pipeline
            .handle_event(WebhookKind::Inbound, inbound_event("Sure", "2026-01-28T10:00:00Z"))
            .await
            .unwrap();
        let conv = h.db.get_conversation_by_external("conv-42").await.unwrap().unwrap();
        let foreign = vec![TranscriptEntry {
            role: TranscriptRole::Lead,
            text: "text from some other thread".into(),
            timestamp: Utc::now(),
        }];
        h.db.save_transcript(conv.id, &foreign, false).await.unwrap();

        let report = h.pipeline.backfill().await.unwrap();
        assert_eq!(report.flagged, 1);
        let stored = h.db.get_conversation(conv.id).await.unwrap().unwrap();
        assert!(stored.needs_review);
        assert_eq!(stored.transcript, foreign);
    }

    #[tokio::test]
    async fn approve_and_reject_are_terminal() {
        let llm = ScriptedLlm::new("pitched", vec![]);
        let h = harness(llm).await;
        let id = drafted_id(
            &h.pipeline
                .handle_event(WebhookKind::Inbound, inbound_event("Sure", "2026-01-28T10:00:00Z"))
                .await
                .unwrap(),
        );
        let approved = h.pipeline.approve(id).await.unwrap();
        assert_eq!(approved.status, DraftStatus::Approved);
        assert!(matches!(
            h.pipeline.reject(id).await,
            Err(PipelineError::DraftNotPending { .. })
        ));
        assert!(matches!(
            h.pipeline.approve(Uuid::new_v4()).await,
            Err(PipelineError::DraftNotFound(_))
        ));
    }

    #[tokio::test]
    async fn log_review_surface_never_fails() {
        let event = ReviewEvent::GenerationFailed {
            conversation_id: Uuid::new_v4(),
            lead_name: "Dana".into(),
            reason: "timeout".into(),
            retry_task_id: Uuid::new_v4(),
        };
        assert!(LogReviewSurface.notify(&event).await.is_ok());
    }

    #[tokio::test]
    async fn commit_failure_opens_retry_task() {
        let llm = ScriptedLlm::new("pitched", vec![]);
        let h = harness(llm).await;
        let event = inbound_event("Sure, tell me more", "2026-01-28T10:00:00Z");

        h.backend.execute_raw("ALTER TABLE drafts RENAME TO drafts_offline").await.unwrap();
        let result = h.pipeline.handle_event(WebhookKind::Inbound, event.clone()).await;
        assert!(result.is_err());
        assert_eq!(h.db.open_retry_tasks().await.unwrap().len(), 1);
        assert_eq!(h.pipeline.locks.tracked(), 0);

        h.backend.execute_raw("ALTER TABLE drafts_offline RENAME TO drafts").await.unwrap();
        // The ledger kept the reply, so redelivery has nothing new to record.
        let again = h.pipeline.handle_event(WebhookKind::Inbound, event).await.unwrap();
        assert_eq!(again, IngestOutcome::Duplicate);

        let report = h.pipeline.retry_failed().await.unwrap();
        assert_eq!(report.drafted, 1);
        let conv = h.db.get_conversation_by_external("conv-42").await.unwrap().unwrap();
        assert_eq!(h.db.drafts_for_conversation(conv.id).await.unwrap().len(), 1);
        assert!(h.db.open_retry_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_entries_do_not_outlive_events() {
        let llm = ScriptedLlm::new("pitched", vec![]);
        let h = harness(llm).await;
        for n in 0..5 {
            let event = normalize(json!({
                "conversation_id": format!("conv-{n}"),
                "lead": {"full_name": "Dana Reyes"},
                "recent_messages": [
                    {"creation_time": "2026-01-28T09:00:00Z", "message": "Hi", "is_reply": false},
                    {"creation_time": "2026-01-28T10:00:00Z", "message": "Hello", "is_reply": true}
                ]
            }))
            .unwrap();
            h.pipeline.handle_event(WebhookKind::Inbound, event).await.unwrap();
        }
        assert_eq!(h.pipeline.locks.tracked(), 0);
    }

    #[tokio::test]
    async fn unreadable_transcript_is_flagged_not_rebuilt() {
        let llm = ScriptedLlm::new("pitched", vec![]);
        let h = harness(llm.clone()).await;
        h.pipeline
            .handle_event(WebhookKind::Inbound, inbound_event("Sure", "2026-01-28T10:00:00Z"))
            .await
            .unwrap();
        h.backend
            .execute_raw(
                r#"UPDATE conversations SET transcript_json = '[{"role":"lead","text":"Sure","time":""}]' WHERE external_id = 'conv-42'"#,
            )
            .await
            .unwrap();

        let outcome = h
            .pipeline
            .handle_event(WebhookKind::Inbound, inbound_event("Tuesday works", "2026-01-28T11:00:00Z"))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::NeedsReview { inserted: 1 });
        assert_eq!(llm.draft_calls(), 1);

        let stored = h.db.get_conversation_by_external("conv-42").await.unwrap().unwrap();
        assert!(stored.needs_review);
        assert!(stored.transcript_unreadable);

        let report = h.pipeline.backfill().await.unwrap();
        assert_eq!(report.flagged, 1);
        assert_eq!(report.rebuilt, 0);
        let stored = h.db.get_conversation(stored.id).await.unwrap().unwrap();
        assert!(stored.transcript_unreadable);
    }

    #[tokio::test]
    async fn regenerate_prompt_carries_profile_and_transcript() {
        let llm = ScriptedLlm::new("calendar_sent", vec![]);
        let h = harness(llm.clone()).await;
        let d1 = drafted_id(
            &h.pipeline
                .handle_event(WebhookKind::Inbound, inbound_event("Send times", "2026-01-28T10:00:00Z"))
                .await
                .unwrap(),
        );

        h.pipeline
            .regenerate(d1, Some("keep it under two lines".into()))
            .await
            .unwrap();
        assert_eq!(llm.draft_calls(), 2);
        let prompt = llm.last_draft_prompt();
        assert!(prompt.contains("Name: Dana Reyes"), "{prompt}");
        assert!(prompt.contains("Company: Acme"), "{prompt}");
        assert!(prompt.contains("Title: VP Sales"), "{prompt}");
        assert!(prompt.contains("OPERATOR: Hi Dana, saw your post on RevOps"), "{prompt}");
        assert!(prompt.contains("LEAD: Send times"), "{prompt}");
        assert!(prompt.contains("keep it under two lines"), "{prompt}");
    }

    #[tokio::test]
    async fn in_flight_result_is_stale_once_a_newer_message_lands() {
        let llm = ScriptedLlm::new("pitched", vec![
            Ok(json!({"reply": "Reply to the first message."}).to_string()),
            Ok(json!({"reply": "Reply to both messages."}).to_string()),
        ]);
        let gate = Arc::new(Notify::new());
        llm.hold_next_draft(gate.clone());
        let h = Arc::new(harness(llm.clone()).await);

        let first = {
            let h = h.clone();
            tokio::spawn(async move {
                h.pipeline
                    .handle_event(WebhookKind::Inbound, inbound_event("Sure", "2026-01-28T10:00:00Z"))
                    .await
                    .unwrap()
            })
        };
        llm.parked.notified().await;

        // The first generation is parked without the lock; the newer message gets through.
        let second = h
            .pipeline
            .handle_event(WebhookKind::Inbound, inbound_event("Actually, Tuesday?", "2026-01-28T10:30:00Z"))
            .await
            .unwrap();
        let current = drafted_id(&second);

        gate.notify_one();
        let stale_id = match first.await.unwrap() {
            IngestOutcome::Generated(GenerationOutcome::Stale { draft_id }) => draft_id,
            other => panic!("expected a stale result, got {other:?}"),
        };

        let stale = h.db.get_draft(stale_id).await.unwrap().unwrap();
        assert_eq!(stale.status, DraftStatus::Superseded);
        let pending = h.pipeline.pending_drafts().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, current);
        assert_eq!(pending[0].text, "Reply to both messages.");

        let created = h
            .review
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ReviewEvent::DraftCreated(_)))
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn idle_gap_reroutes_advanced_conversation() {
        let llm = ScriptedLlm::new("positive_reply", vec![]);
        let h = harness(llm).await;
        h.pipeline
            .handle_event(WebhookKind::Inbound, inbound_event("Sure", "2026-01-28T10:00:00Z"))
            .await
            .unwrap();
        h.pipeline.override_stage("conv-42", FunnelStage::Pitched).await.unwrap();

        // Thirteen days of silence, then the lead comes back.
        let outcome = h
            .pipeline
            .handle_event(WebhookKind::Inbound, inbound_event("Sorry, been travelling", "2026-02-10T10:00:00Z"))
            .await
            .unwrap();
        let draft_id = drafted_id(&outcome);
        let draft = h.db.get_draft(draft_id).await.unwrap().unwrap();
        assert_eq!(draft.stage, FunnelStage::Regeneration);

        let conv = h.db.get_conversation_by_external("conv-42").await.unwrap().unwrap();
        assert_eq!(conv.funnel_stage, FunnelStage::Regeneration);
    }
}
