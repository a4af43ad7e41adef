//! Draft generator: one model call per draft, plus at most one follow-up
//! when the model asks for listed reference material.
//!
//! The model answers `{"reply": "...", "requested_resources": [...]}`. Only
//! the `reply` string ever becomes draft text; anything else is a
//! [`GenerationFailed`].

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::context::AssembledContext;
use crate::error::GenerationFailed;
use crate::llm::parse::unwrap_json_object;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};

const DRAFT_MAX_TOKENS: u32 = 800;
const DRAFT_TEMPERATURE: f32 = 0.7;

/// A successful generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedReply {
    pub reply: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: Decimal,
}

/// Structured model output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplyPayload {
    pub reply: String,
    #[serde(default)]
    pub requested_resources: Vec<String>,
}

pub struct DraftGenerator {
    llm: Arc<dyn LlmProvider>,
}

impl DraftGenerator {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Generate a reply for an assembled context.
    pub async fn generate(&self, context: &AssembledContext) -> Result<GeneratedReply, GenerationFailed> {
        let (mut payload, mut input_tokens, mut output_tokens) = self.call(context).await?;

        if !payload.requested_resources.is_empty()
            && let Some(follow_up) = context.with_requested(&payload.requested_resources)
        {
            info!(
                stage = %context.stage,
                requested = payload.requested_resources.len(),
                "Model requested reference material, running follow-up call"
            );
            let (second, more_in, more_out) = self.call(&follow_up).await?;
            payload = second;
            input_tokens += more_in;
            output_tokens += more_out;
        }

        Ok(GeneratedReply {
            reply: payload.reply,
            model: self.llm.model_name().to_string(),
            input_tokens,
            output_tokens,
            cost_usd: self.llm.estimate_cost(input_tokens, output_tokens),
        })
    }

    async fn call(&self, context: &AssembledContext) -> Result<(ReplyPayload, u32, u32), GenerationFailed> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(context.system_prompt.clone()),
            ChatMessage::user(context.render_user()),
        ])
        .with_max_tokens(DRAFT_MAX_TOKENS)
        .with_temperature(DRAFT_TEMPERATURE);

        let response = self.llm.complete(request).await?;
        debug!(
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Draft completion received"
        );
        let payload = parse_reply(&response.content)?;
        Ok((payload, response.input_tokens, response.output_tokens))
    }
}

/// Parse the model's structured reply.
pub fn parse_reply(raw: &str) -> Result<ReplyPayload, GenerationFailed> {
    let unwrapped = unwrap_json_object(raw);
    if unwrapped.was_wrapped {
        warn!("Draft output was wrapped in formatting, stripped before parsing");
    }
    let mut payload: ReplyPayload = serde_json::from_str(&unwrapped.body)
        .map_err(|e| GenerationFailed::Malformed(format!("reply is not the expected JSON object: {e}")))?;
    payload.reply = payload.reply.trim().to_string();
    if payload.reply.is_empty() {
        return Err(GenerationFailed::EmptyReply);
    }
    Ok(payload)
}
