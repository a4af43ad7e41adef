//! Stage classifier: maps (transcript, lead) to a funnel stage with rationale.
//!
//! Order of decisions:
//! 1. Idle gap: an advanced conversation that went quiet longer than the
//!    threshold is routed to `Regeneration` without a model call.
//! 2. Model call returning `{"stage": ..., "rationale": ...}`. Fences are
//!    stripped (with a warning) before parsing, and the token is validated
//!    against [`FunnelStage`].
//! 3. Any failure keeps the previous stage.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::conversation::Lead;
use crate::llm::parse::unwrap_json_object;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::stage::model::FunnelStage;
use crate::transcript::{TranscriptEntry, TranscriptRole};

const CLASSIFY_MAX_TOKENS: u32 = 300;
const CLASSIFY_TEMPERATURE: f32 = 0.0;

/// Classifier tuning.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Silence longer than this before the newest message counts as idle.
    pub idle_threshold: Duration,
    /// Whether an idle `Booked` conversation is also routed to `Regeneration`.
    pub reroute_booked: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::days(7),
            reroute_booked: false,
        }
    }
}

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageSource {
    Model,
    IdleGap,
    Fallback,
    /// Carried over from the draft being regenerated.
    Reused,
}

/// A validated stage decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageClassification {
    pub stage: FunnelStage,
    pub rationale: String,
    pub source: StageSource,
}

#[derive(Debug, Deserialize)]
struct StageResponse {
    #[serde(alias = "detected_stage")]
    stage: String,
    #[serde(default, alias = "reasoning")]
    rationale: String,
}

pub struct StageClassifier {
    llm: Arc<dyn LlmProvider>,
    config: ClassifierConfig,
}

impl StageClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, config: ClassifierConfig) -> Self {
        Self { llm, config }
    }

    /// Classify a conversation. Never fails; falls back to `previous`.
    pub async fn classify(
        &self,
        transcript: &[TranscriptEntry],
        lead: &Lead,
        previous: FunnelStage,
    ) -> StageClassification {
        if let Some(idle) = self.idle_reroute(transcript, previous) {
            debug!(previous = %previous, "Idle gap routes conversation to regeneration");
            return idle;
        }

        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_classify_system_prompt()),
            ChatMessage::user(build_classify_user_prompt(transcript, lead, previous)),
        ])
        .with_max_tokens(CLASSIFY_MAX_TOKENS)
        .with_temperature(CLASSIFY_TEMPERATURE);

        let raw = match self.llm.complete(request).await {
            Ok(response) => response.content,
            Err(e) => {
                warn!(error = %e, previous = %previous, "Stage classification call failed, keeping previous stage");
                return fallback(previous, format!("classifier unavailable: {e}"));
            }
        };

        match parse_stage_response(&raw) {
            Ok((stage, rationale)) => StageClassification {
                stage,
                rationale,
                source: StageSource::Model,
            },
            Err(reason) => {
                warn!(%reason, previous = %previous, "Unusable stage classification, keeping previous stage");
                fallback(previous, reason)
            }
        }
    }

    fn idle_reroute(
        &self,
        transcript: &[TranscriptEntry],
        previous: FunnelStage,
    ) -> Option<StageClassification> {
        let eligible = previous.is_advanced()
            && (previous != FunnelStage::Booked || self.config.reroute_booked);
        if !eligible {
            return None;
        }
        let gap = idle_gap(transcript)?;
        if gap <= self.config.idle_threshold {
            return None;
        }
        Some(StageClassification {
            stage: FunnelStage::Regeneration,
            rationale: format!(
                "{} days of silence after reaching {}",
                gap.num_days(),
                previous
            ),
            source: StageSource::IdleGap,
        })
    }
}

fn fallback(previous: FunnelStage, reason: String) -> StageClassification {
    StageClassification {
        stage: previous,
        rationale: reason,
        source: StageSource::Fallback,
    }
}

/// Time between the newest message and the one before it.
pub fn idle_gap(transcript: &[TranscriptEntry]) -> Option<Duration> {
    match transcript {
        [.., before, last] => Some(last.timestamp - before.timestamp),
        _ => None,
    }
}

/// Parse and validate the model's stage answer.
pub fn parse_stage_response(raw: &str) -> Result<(FunnelStage, String), String> {
    let unwrapped = unwrap_json_object(raw);
    if unwrapped.was_wrapped {
        warn!("Stage classification output was wrapped in formatting, stripped before parsing");
    }
    let response: StageResponse = serde_json::from_str(&unwrapped.body)
        .map_err(|e| format!("stage response is not valid JSON: {e}"))?;
    let stage = response
        .stage
        .parse::<FunnelStage>()
        .map_err(|e| format!("stage token rejected: {e}"))?;
    Ok((stage, response.rationale.trim().to_string()))
}

fn build_classify_system_prompt() -> String {
    let tokens: Vec<&str> = FunnelStage::ALL.iter().map(FunnelStage::as_str).collect();
    format!(
        "You classify sales conversations into a funnel stage.\n\
         Stages:\n\
         - positive_reply: the lead replied with interest; nothing offered yet.\n\
         - pitched: the operator proposed a call or meeting.\n\
         - calendar_sent: the operator shared a scheduling link.\n\
         - booked: a meeting time is confirmed.\n\
         - regeneration: an earlier thread went cold and needs a fresh angle.\n\
         - re_engagement: the lead went quiet and the operator is following up.\n\n\
         Respond with JSON only: {{\"stage\": one of [{}], \"rationale\": \"one sentence\"}}",
        tokens.join(", ")
    )
}

fn build_classify_user_prompt(
    transcript: &[TranscriptEntry],
    lead: &Lead,
    previous: FunnelStage,
) -> String {
    let mut prompt = String::new();
    for (label, value) in lead.profile_fields() {
        prompt.push_str(&format!("{label}: {value}\n"));
    }
    prompt.push_str(&format!("Current stage: {previous}\n\nConversation:\n"));
    for entry in transcript {
        let who = match entry.role {
            TranscriptRole::Lead => "LEAD",
            TranscriptRole::Operator => "OPERATOR",
        };
        prompt.push_str(&format!("[{}] {who}: {}\n", entry.timestamp.format("%Y-%m-%d %H:%M"), entry.text));
    }
    if let Some(last) = transcript.last() {
        prompt.push_str(&format!("\nMost recent message: {}\n", last.text));
    }
    prompt
}
