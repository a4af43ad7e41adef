//! Role-tagged transcript entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::Direction;

/// Who said a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    Lead,
    /// Older cached transcripts label the operator side `you`.
    #[serde(alias = "you")]
    Operator,
}

impl TranscriptRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptRole::Lead => "lead",
            TranscriptRole::Operator => "operator",
        }
    }
}

impl From<Direction> for TranscriptRole {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Inbound => TranscriptRole::Lead,
            Direction::Outbound => TranscriptRole::Operator,
        }
    }
}

/// One line of a conversation transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    #[serde(alias = "content")]
    pub text: String,
    #[serde(alias = "time")]
    pub timestamp: DateTime<Utc>,
}
