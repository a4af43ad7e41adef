//! Wire shapes of the upstream automation platform's webhooks.
//!
//! Payloads arrive either wrapped as `{"body": {...}}` or with the same fields
//! at the top level. Required fields are enforced by deserialization.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct LeadPayload {
    pub full_name: String,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default, alias = "title")]
    pub position: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, alias = "about")]
    pub summary: Option<String>,
    #[serde(default)]
    pub profile_url: Option<String>,
    #[serde(default)]
    pub personalized_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePayload {
    pub creation_time: String,
    pub message: String,
    /// `true` when the lead sent it. Absent on some platform events.
    #[serde(default)]
    pub is_reply: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderPayload {
    pub id: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CampaignPayload {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Body shared by the inbound and outbound webhooks.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookBody {
    pub conversation_id: String,
    pub lead: LeadPayload,
    #[serde(default)]
    pub recent_messages: Vec<MessagePayload>,
    #[serde(default)]
    pub sender: Option<SenderPayload>,
    #[serde(default)]
    pub campaign: Option<CampaignPayload>,
}

/// Render a platform id that may be sent as a number or a string.
pub(crate) fn id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
