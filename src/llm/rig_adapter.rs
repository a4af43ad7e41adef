//! Bridges rig-core's `CompletionModel` to our `LlmProvider` trait.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use rig::completion::{AssistantContent, CompletionModel};
use rig::message::Message;
use rust_decimal::Decimal;

use crate::error::LlmError;
use crate::llm::costs;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

/// Wraps any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
        }
    }
}

/// Status code after a "status" label, e.g. `status: 400`, `status code 401`
/// or reqwest's `HTTP status client error (429 Too Many Requests)`.
static LABELLED_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bstatus(?:\s+code)?\b[^0-9]{0,24}\b([1-5][0-9]{2})\b").expect("static regex")
});

/// A bare code followed by its reason phrase, e.g. `503 Service Unavailable`.
static REASONED_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b([45][0-9]{2})\s+(?:bad request|unauthorized|forbidden|not found|too many requests|internal server error|bad gateway|service unavailable|gateway timeout)\b",
    )
    .expect("static regex")
});

/// Extract the HTTP status a provider error reports, if it names one.
fn http_status(message: &str) -> Option<u16> {
    LABELLED_STATUS
        .captures(message)
        .or_else(|| REASONED_STATUS.captures(message))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Map a rig error message onto our error kinds. A reported status code
/// wins over keywords; numbers elsewhere in the text are ignored.
fn classify_error(provider: &str, message: String) -> LlmError {
    let provider = provider.to_string();
    if let Some(status) = http_status(&message) {
        return match status {
            429 | 529 => LlmError::RateLimited {
                provider,
                retry_after: None,
            },
            401 | 403 => LlmError::AuthFailed { provider },
            400..=499 => LlmError::InvalidRequest {
                provider,
                reason: message,
            },
            _ => LlmError::RequestFailed {
                provider,
                reason: message,
            },
        };
    }

    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("overloaded") {
        LlmError::RateLimited {
            provider,
            retry_after: None,
        }
    } else if lower.contains("unauthorized") || lower.contains("authentication") {
        LlmError::AuthFailed { provider }
    } else if lower.contains("invalid_request") {
        LlmError::InvalidRequest {
            provider,
            reason: message,
        }
    } else if lower.contains("json") || lower.contains("deserializ") {
        LlmError::InvalidResponse {
            provider,
            reason: message,
        }
    } else {
        LlmError::RequestFailed {
            provider,
            reason: message,
        }
    }
}

fn to_rig_message(message: &ChatMessage) -> Option<Message> {
    match message.role {
        Role::User => Some(Message::user(message.content.clone())),
        Role::Assistant => Some(Message::assistant(message.content.clone())),
        Role::System => None,
    }
}

fn saturating_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        costs::model_cost(&self.model_name).unwrap_or_else(costs::default_cost)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let system = request.system_prompt();
        let mut turns: Vec<Message> = request.messages.iter().filter_map(to_rig_message).collect();
        let prompt = turns.pop().ok_or_else(|| LlmError::InvalidRequest {
            provider: self.provider.to_string(),
            reason: "completion request has no user message".to_string(),
        })?;

        let mut builder = self.model.completion_request(prompt).messages(turns);
        if let Some(system) = system {
            builder = builder.preamble(system);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_error(self.provider, e.to_string()))?;

        let content: String = response
            .choice
            .into_iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        tracing::debug!(
            provider = self.provider,
            model = %self.model_name,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Completion finished"
        );

        Ok(CompletionResponse {
            content,
            input_tokens: saturating_u32(response.usage.input_tokens),
            output_tokens: saturating_u32(response.usage.output_tokens),
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}
