//! Stage → prompt template map, injected into the context assembler.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::stage::FunnelStage;

/// How the generator should approach a reply at a given stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTemplate {
    /// Stage-specific instructions for the reply writer.
    pub instructions: String,
    /// Soft target for reply length, passed to the model.
    pub max_reply_words: usize,
}

#[derive(Debug, Clone)]
pub struct StageTemplates {
    base_prompt: String,
    templates: HashMap<FunnelStage, StageTemplate>,
    default: StageTemplate,
}

impl StageTemplates {
    pub fn new(base_prompt: impl Into<String>, default: StageTemplate) -> Self {
        Self {
            base_prompt: base_prompt.into(),
            templates: HashMap::new(),
            default,
        }
    }

    pub fn with(mut self, stage: FunnelStage, template: StageTemplate) -> Self {
        self.templates.insert(stage, template);
        self
    }

    /// Template for `stage`, or the default when none is configured.
    pub fn get(&self, stage: FunnelStage) -> &StageTemplate {
        self.templates.get(&stage).unwrap_or(&self.default)
    }

    pub fn base_prompt(&self) -> &str {
        &self.base_prompt
    }

    /// Built-in templates for every stage.
    pub fn builtin() -> Self {
        let t = |instructions: &str, max_reply_words| StageTemplate {
            instructions: instructions.to_string(),
            max_reply_words,
        };
        Self::new(
            "You write short, human LinkedIn replies on behalf of the operator. \
             Match the lead's tone, never invent facts about them, and keep the \
             conversation moving toward a call.",
            t("Reply naturally to the lead's latest message.", 80),
        )
        .with(
            FunnelStage::PositiveReply,
            t(
                "The lead responded with interest. Acknowledge what they said and \
                 propose a short call without pressure.",
                70,
            ),
        )
        .with(
            FunnelStage::Pitched,
            t(
                "A call has been proposed. Answer any questions and make it easy to \
                 say yes to a time.",
                70,
            ),
        )
        .with(
            FunnelStage::CalendarSent,
            t(
                "A scheduling link was shared. Help them pick a time and remove friction.",
                50,
            ),
        )
        .with(
            FunnelStage::Booked,
            t(
                "The meeting is booked. Confirm details and set expectations for the call.",
                50,
            ),
        )
        .with(
            FunnelStage::Regeneration,
            t(
                "The thread went cold after progress was made. Re-open it with a fresh, \
                 relevant angle rather than repeating the earlier offer.",
                70,
            ),
        )
        .with(
            FunnelStage::ReEngagement,
            t(
                "The lead went quiet. Send a light follow-up that gives them an easy way back in.",
                50,
            ),
        )
    }
}
