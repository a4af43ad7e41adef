//! Review surface contract: where pending drafts are shown to a human.
//!
//! The pipeline emits [`ReviewEvent`]s; decisions come back as
//! approve/reject/regenerate commands over HTTP (see `server::review`).

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::ReviewError;
use crate::stage::StageSource;
use crate::transcript::{TranscriptEntry, TranscriptRole};

/// How many transcript lines a notification carries.
const CONTEXT_LINES: usize = 6;

/// Everything a reviewer needs to judge one draft.
#[derive(Debug, Clone, Serialize)]
pub struct DraftNotification {
    pub draft_id: Uuid,
    pub conversation_id: Uuid,
    pub lead_name: String,
    pub lead_title: Option<String>,
    pub lead_company: Option<String>,
    pub stage: String,
    pub stage_rationale: String,
    pub stage_source: StageSource,
    pub draft_text: String,
    pub recent_messages: Vec<TranscriptEntry>,
    /// Draft this one replaced, when it came from a regeneration or a newer message.
    pub supersedes: Option<Uuid>,
}

impl DraftNotification {
    /// Keep only the tail of a transcript for display.
    pub fn tail(transcript: &[TranscriptEntry]) -> Vec<TranscriptEntry> {
        transcript[transcript.len().saturating_sub(CONTEXT_LINES)..].to_vec()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReviewEvent {
    DraftCreated(DraftNotification),
    GenerationFailed {
        conversation_id: Uuid,
        lead_name: String,
        reason: String,
        retry_task_id: Uuid,
    },
}

impl ReviewEvent {
    /// Plain-text summary, used as chat fallback text and in logs.
    pub fn summary(&self) -> String {
        match self {
            ReviewEvent::DraftCreated(n) => format!("New draft for {} ({})", n.lead_name, n.stage),
            ReviewEvent::GenerationFailed { lead_name, reason, .. } => {
                format!("Draft generation failed for {lead_name}, retry queued: {reason}")
            }
        }
    }
}

#[async_trait]
pub trait ReviewSurface: Send + Sync {
    async fn notify(&self, event: &ReviewEvent) -> Result<(), ReviewError>;
}

/// Posts events to a chat-ops incoming webhook as Block Kit style JSON.
pub struct HttpReviewSurface {
    client: reqwest::Client,
    url: String,
}

impl HttpReviewSurface {
    pub fn new(url: impl Into<String>) -> Result<Self, ReviewError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ReviewError::Http(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ReviewSurface for HttpReviewSurface {
    async fn notify(&self, event: &ReviewEvent) -> Result<(), ReviewError> {
        let response = self
            .client
            .post(&self.url)
            .json(&render_message(event))
            .send()
            .await
            .map_err(|e| ReviewError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ReviewError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Review surface that only logs. Used when no webhook URL is configured.
pub struct LogReviewSurface;

#[async_trait]
impl ReviewSurface for LogReviewSurface {
    async fn notify(&self, event: &ReviewEvent) -> Result<(), ReviewError> {
        match event {
            ReviewEvent::DraftCreated(n) => info!(
                draft_id = %n.draft_id,
                conversation_id = %n.conversation_id,
                stage = %n.stage,
                "{}",
                event.summary()
            ),
            ReviewEvent::GenerationFailed { conversation_id, .. } => {
                info!(conversation_id = %conversation_id, "{}", event.summary())
            }
        }
        Ok(())
    }
}

/// Chat message payload with fallback text, sections and decision buttons.
pub fn render_message(event: &ReviewEvent) -> serde_json::Value {
    let mut blocks = Vec::new();
    match event {
        ReviewEvent::DraftCreated(n) => {
            let mut who = format!("*{}*", n.lead_name);
            if let Some(title) = &n.lead_title {
                who.push_str(&format!(", {title}"));
            }
            if let Some(company) = &n.lead_company {
                who.push_str(&format!(" at {company}"));
            }
            blocks.push(section("lead", &who));
            blocks.push(section(
                "stage",
                &format!("*Stage:* `{}`\n{}", n.stage, n.stage_rationale),
            ));
            let history: Vec<String> = n
                .recent_messages
                .iter()
                .map(|e| {
                    let who = match e.role {
                        TranscriptRole::Lead => "Lead",
                        TranscriptRole::Operator => "You",
                    };
                    format!("> *{who}:* {}", e.text)
                })
                .collect();
            if !history.is_empty() {
                blocks.push(section("history", &history.join("\n")));
            }
            blocks.push(section("draft", &format!("*Draft:*\n{}", n.draft_text)));
            let id = n.draft_id.to_string();
            blocks.push(json!({
                "type": "actions",
                "block_id": "decision",
                "elements": [
                    button("approve", "Approve", &id, Some("primary")),
                    button("regenerate", "Regenerate", &id, None),
                    button("reject", "Reject", &id, Some("danger")),
                ]
            }));
        }
        ReviewEvent::GenerationFailed { retry_task_id, .. } => {
            blocks.push(section("failure", &event.summary()));
            blocks.push(json!({
                "type": "context",
                "block_id": "retry",
                "elements": [{ "type": "mrkdwn", "text": format!("retry task `{retry_task_id}`") }]
            }));
        }
    }
    json!({ "text": event.summary(), "blocks": blocks })
}

fn section(block_id: &str, text: &str) -> serde_json::Value {
    json!({
        "type": "section",
        "block_id": block_id,
        "text": { "type": "mrkdwn", "text": text }
    })
}

fn button(action_id: &str, label: &str, value: &str, style: Option<&str>) -> serde_json::Value {
    let mut b = json!({
        "type": "button",
        "action_id": action_id,
        "text": { "type": "plain_text", "text": label },
        "value": value,
    });
    if let Some(style) = style {
        b["style"] = json!(style);
    }
    b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification() -> DraftNotification {
        DraftNotification {
            draft_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            lead_name: "Dana Reyes".into(),
            lead_title: Some("VP Sales".into()),
            lead_company: Some("Acme".into()),
            stage: "pitched".into(),
            stage_rationale: "call proposed".into(),
            stage_source: StageSource::Model,
            draft_text: "Does Thursday work?".into(),
            recent_messages: vec![],
            supersedes: None,
        }
    }

    #[test]
    fn draft_message_has_decision_buttons() {
        let n = notification();
        let id = n.draft_id.to_string();
        let message = render_message(&ReviewEvent::DraftCreated(n));
        assert_eq!(message["text"], "New draft for Dana Reyes (pitched)");
        let blocks = message["blocks"].as_array().unwrap();
        let actions = blocks.iter().find(|b| b["type"] == "actions").unwrap();
        let ids: Vec<&str> = actions["elements"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["action_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["approve", "regenerate", "reject"]);
        assert_eq!(actions["elements"][0]["value"], id);
        assert!(blocks.iter().any(|b| b["text"]["text"].as_str().unwrap_or("").contains("Does Thursday work?")));
    }

    #[test]
    fn failure_message_names_retry_task() {
        let task = Uuid::new_v4();
        let event = ReviewEvent::GenerationFailed {
            conversation_id: Uuid::new_v4(),
            lead_name: "Dana Reyes".into(),
            reason: "generation timed out".into(),
            retry_task_id: task,
        };
        let message = render_message(&event);
        assert!(message["text"].as_str().unwrap().contains("retry queued"));
        assert!(message.to_string().contains(&task.to_string()));
    }

    #[test]
    fn tail_keeps_last_lines() {
        let entries: Vec<TranscriptEntry> = (0..10)
            .map(|i| TranscriptEntry {
                role: TranscriptRole::Lead,
                text: format!("m{i}"),
                timestamp: chrono::Utc::now(),
            })
            .collect();
        let tail = DraftNotification::tail(&entries);
        assert_eq!(tail.len(), CONTEXT_LINES);
        assert_eq!(tail.last().unwrap().text, "m9");
    }
}
