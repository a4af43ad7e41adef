//! Lead and conversation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stage::FunnelStage;
use crate::transcript::TranscriptEntry;

/// Identity and profile attributes of a prospect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
    /// The first-touch message the operator sent this lead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personalized_message: Option<String>,
}

impl Lead {
    /// Labelled profile fields that carry a value, in display order.
    pub fn profile_fields(&self) -> Vec<(&'static str, &str)> {
        let mut fields = Vec::new();
        if !self.full_name.trim().is_empty() {
            fields.push(("Name", self.full_name.trim()));
        }
        let optional = [
            ("Title", &self.title),
            ("Company", &self.company),
            ("Location", &self.location),
            ("Summary", &self.summary),
            ("Profile", &self.profile_url),
            ("First-touch message", &self.personalized_message),
        ];
        for (label, value) in optional {
            if let Some(v) = value.as_deref().map(str::trim)
                && !v.is_empty()
            {
                fields.push((label, v));
            }
        }
        fields
    }

    /// Merge a refreshed profile: present fields replace, absent ones are kept.
    pub fn refresh(&mut self, newer: &Lead) {
        if !newer.full_name.trim().is_empty() {
            self.full_name = newer.full_name.clone();
        }
        let pairs = [
            (&mut self.title, &newer.title),
            (&mut self.company, &newer.company),
            (&mut self.location, &newer.location),
            (&mut self.summary, &newer.summary),
            (&mut self.profile_url, &newer.profile_url),
            (&mut self.personalized_message, &newer.personalized_message),
        ];
        for (current, incoming) in pairs {
            if incoming.as_deref().is_some_and(|v| !v.trim().is_empty()) {
                current.clone_from(incoming);
            }
        }
    }
}

/// One conversation per lead.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: Uuid,
    /// Conversation id on the upstream automation platform.
    pub external_id: String,
    pub lead: Lead,
    /// Sending account on the upstream platform.
    pub sender_id: Option<String>,
    pub funnel_stage: FunnelStage,
    pub transcript: Vec<TranscriptEntry>,
    /// The stored transcript could not be parsed. `transcript` is empty and
    /// must not be written back over the original.
    pub transcript_unreadable: bool,
    /// Bumped each time a generation is started; stale results are discarded.
    pub generation_seq: i64,
    /// Set when the transcript could not be reconciled with the ledger.
    pub needs_review: bool,
    pub archived: bool,
    /// `sent_at` of the newest ledger entry.
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
