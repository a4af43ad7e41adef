//! Draft records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::drafts::generator::GeneratedReply;
use crate::stage::{FunnelStage, StageClassification};

/// Lifecycle of a draft.
///
/// Only `Pending` is live. Every other status is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    Pending,
    Approved,
    Rejected,
    Superseded,
    Expired,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Pending => "pending",
            DraftStatus::Approved => "approved",
            DraftStatus::Rejected => "rejected",
            DraftStatus::Superseded => "superseded",
            DraftStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DraftStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DraftStatus::Pending),
            "approved" => Ok(DraftStatus::Approved),
            "rejected" => Ok(DraftStatus::Rejected),
            "superseded" => Ok(DraftStatus::Superseded),
            "expired" => Ok(DraftStatus::Expired),
            other => Err(format!("unknown draft status '{other}'")),
        }
    }
}

/// Automated quality-gate annotation. Not populated by the pipeline yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QaAnnotation {
    pub score: Option<f32>,
    pub verdict: Option<String>,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// One generation attempt for a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct Draft {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub text: String,
    pub stage: FunnelStage,
    pub stage_rationale: String,
    pub status: DraftStatus,
    /// Reviewer reason when this draft came from a regeneration.
    pub guidance: Option<String>,
    pub model: Option<String>,
    pub cost_usd: Decimal,
    pub qa: Option<QaAnnotation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Draft {
    /// A new pending draft whose text is the generated `reply` field.
    pub fn pending(
        conversation_id: Uuid,
        reply: &GeneratedReply,
        classification: &StageClassification,
        guidance: Option<&str>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            text: reply.reply.clone(),
            stage: classification.stage,
            stage_rationale: classification.rationale.clone(),
            status: DraftStatus::Pending,
            guidance: guidance.map(str::to_string),
            model: Some(reply.model.clone()),
            cost_usd: reply.cost_usd,
            qa: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageSource;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            DraftStatus::Pending,
            DraftStatus::Approved,
            DraftStatus::Rejected,
            DraftStatus::Superseded,
            DraftStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<DraftStatus>(), Ok(status));
        }
    }

    #[test]
    fn pending_draft_takes_reply_text() {
        let reply = GeneratedReply {
            reply: "Happy to chat Thursday".into(),
            model: "claude-sonnet-4".into(),
            input_tokens: 100,
            output_tokens: 20,
            cost_usd: Decimal::new(5, 4),
        };
        let classification = StageClassification {
            stage: FunnelStage::Pitched,
            rationale: "call proposed".into(),
            source: StageSource::Model,
        };
        let draft = Draft::pending(Uuid::new_v4(), &reply, &classification, Some("shorter"));
        assert_eq!(draft.text, "Happy to chat Thursday");
        assert_eq!(draft.status, DraftStatus::Pending);
        assert_eq!(draft.stage, FunnelStage::Pitched);
        assert_eq!(draft.guidance.as_deref(), Some("shorter"));
        assert_eq!(draft.model.as_deref(), Some("claude-sonnet-4"));
    }
}
