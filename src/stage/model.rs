//! Funnel stages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Funnel-progress classification of a conversation.
///
/// Not strictly linear: an idle conversation can be routed back to
/// `Regeneration` from an advanced stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStage {
    #[default]
    PositiveReply,
    Pitched,
    CalendarSent,
    Booked,
    Regeneration,
    ReEngagement,
}

impl FunnelStage {
    pub const ALL: [FunnelStage; 6] = [
        FunnelStage::PositiveReply,
        FunnelStage::Pitched,
        FunnelStage::CalendarSent,
        FunnelStage::Booked,
        FunnelStage::Regeneration,
        FunnelStage::ReEngagement,
    ];

    /// Machine token used in storage and model output.
    pub fn as_str(&self) -> &'static str {
        match self {
            FunnelStage::PositiveReply => "positive_reply",
            FunnelStage::Pitched => "pitched",
            FunnelStage::CalendarSent => "calendar_sent",
            FunnelStage::Booked => "booked",
            FunnelStage::Regeneration => "regeneration",
            FunnelStage::ReEngagement => "re_engagement",
        }
    }

    /// Stages reached only after the operator made an offer.
    pub fn is_advanced(&self) -> bool {
        matches!(
            self,
            FunnelStage::Pitched | FunnelStage::CalendarSent | FunnelStage::Booked
        )
    }
}

impl fmt::Display for FunnelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FunnelStage {
    type Err = String;

    /// Accepts the snake_case token in any case, with `-` or space as separators.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_lowercase().replace(['-', ' '], "_");
        FunnelStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == token)
            .ok_or_else(|| format!("unknown funnel stage '{}'", s.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip_through_from_str() {
        for stage in FunnelStage::ALL {
            assert_eq!(stage.as_str().parse::<FunnelStage>(), Ok(stage));
        }
    }

    #[test]
    fn parse_tolerates_case_and_separators() {
        assert_eq!("CALENDAR_SENT".parse(), Ok(FunnelStage::CalendarSent));
        assert_eq!("re-engagement".parse(), Ok(FunnelStage::ReEngagement));
        assert_eq!(" Positive Reply ".parse(), Ok(FunnelStage::PositiveReply));
    }

    #[test]
    fn unknown_token_is_rejected() {
        assert!("initiated".parse::<FunnelStage>().is_err());
        assert!("".parse::<FunnelStage>().is_err());
    }

    #[test]
    fn serde_uses_snake_case_tokens() {
        let json = serde_json::to_string(&FunnelStage::CalendarSent).unwrap();
        assert_eq!(json, "\"calendar_sent\"");
    }

    #[test]
    fn advanced_stages() {
        assert!(FunnelStage::Booked.is_advanced());
        assert!(!FunnelStage::PositiveReply.is_advanced());
        assert!(!FunnelStage::Regeneration.is_advanced());
    }
}
