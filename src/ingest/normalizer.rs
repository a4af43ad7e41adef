//! Event normalizer: validates a webhook body and maps it to canonical records.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::conversation::Lead;
use crate::error::IngestError;
use crate::ingest::webhook::{WebhookBody, id_to_string};
use crate::ledger::{Campaign, CanonicalMessage, Direction};

/// A validated webhook event.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub external_conversation_id: String,
    pub lead: Lead,
    pub sender_id: Option<String>,
    /// Window messages in delivery order, direction taken from `is_reply`.
    pub messages: Vec<CanonicalMessage>,
    /// Messages dropped because the platform sent no direction flag.
    pub unattributed: usize,
}

/// Parse and validate a raw webhook payload.
pub fn normalize(raw: Value) -> Result<WebhookEvent, IngestError> {
    let body = match raw {
        Value::Object(mut map) if map.get("body").is_some_and(Value::is_object) => {
            map.remove("body").unwrap_or(Value::Null)
        }
        Value::Object(map) => Value::Object(map),
        _ => return Err(IngestError::Malformed("payload must be a JSON object".into())),
    };

    let body: WebhookBody =
        serde_json::from_value(body).map_err(|e| IngestError::Malformed(e.to_string()))?;

    let external_conversation_id = body.conversation_id.trim().to_string();
    if external_conversation_id.is_empty() {
        return Err(IngestError::MissingField("conversation_id"));
    }
    if body.lead.full_name.trim().is_empty() {
        return Err(IngestError::MissingField("lead.full_name"));
    }

    let campaign = body.campaign.as_ref().and_then(|c| {
        let campaign = Campaign {
            id: c.id.as_ref().and_then(id_to_string),
            name: c.name.clone().filter(|n| !n.trim().is_empty()),
        };
        (campaign.id.is_some() || campaign.name.is_some()).then_some(campaign)
    });

    let mut messages = Vec::with_capacity(body.recent_messages.len());
    let mut unattributed = 0;
    for msg in &body.recent_messages {
        let content = msg.message.trim();
        if content.is_empty() {
            continue;
        }
        let Some(is_reply) = msg.is_reply else {
            unattributed += 1;
            continue;
        };
        let direction = Direction::from_is_reply(is_reply);
        messages.push(CanonicalMessage {
            direction,
            content: content.to_string(),
            sent_at: parse_timestamp(&msg.creation_time)?,
            campaign: match direction {
                Direction::Outbound => campaign.clone(),
                Direction::Inbound => None,
            },
        });
    }

    if unattributed > 0 {
        warn!(
            conversation = %external_conversation_id,
            unattributed,
            "Dropped window messages without a direction flag"
        );
    }

    let lead_payload = body.lead;
    let lead = Lead {
        full_name: lead_payload.full_name.trim().to_string(),
        title: non_blank(lead_payload.position),
        company: non_blank(lead_payload.company_name),
        location: non_blank(lead_payload.location),
        summary: non_blank(lead_payload.summary),
        profile_url: non_blank(lead_payload.profile_url),
        personalized_message: non_blank(lead_payload.personalized_message),
    };

    Ok(WebhookEvent {
        external_conversation_id,
        lead,
        sender_id: body.sender.as_ref().and_then(|s| id_to_string(&s.id)),
        messages,
        unattributed,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parse a platform timestamp; naive timestamps are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, IngestError> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(ndt.and_utc());
        }
    }
    Err(IngestError::InvalidTimestamp {
        field: "creation_time",
        value: raw.to_string(),
    })
}
