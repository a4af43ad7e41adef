//! Error types for the speed-to-lead service.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Review surface error: {0}")]
    Review(#[from] ReviewError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} rejected the request: {reason}")]
    InvalidRequest { provider: String, reason: String },

    #[error("Context length exceeded: {used} tokens used, {limit} allowed")]
    ContextLengthExceeded { used: usize, limit: usize },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether a retry has any chance of succeeding.
    ///
    /// Network failures, timeouts, rate limits and garbled responses are
    /// transient. Auth failures and requests the provider rejected as invalid
    /// are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RequestFailed { .. }
                | LlmError::RateLimited { .. }
                | LlmError::Timeout { .. }
                | LlmError::InvalidResponse { .. }
        )
    }
}

/// Webhook payload validation errors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid timestamp in {field}: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
}

/// Why a draft could not be produced.
///
/// Carried as a typed outcome so a failed generation can never be mistaken
/// for reply text.
#[derive(Debug, thiserror::Error)]
pub enum GenerationFailed {
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider failure: {0}")]
    Provider(#[source] LlmError),

    #[error("malformed model output: {0}")]
    Malformed(String),

    #[error("model returned an empty reply")]
    EmptyReply,
}

impl From<LlmError> for GenerationFailed {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout { after, .. } => GenerationFailed::Timeout(after),
            LlmError::InvalidResponse { reason, .. } => GenerationFailed::Malformed(reason),
            other => GenerationFailed::Provider(other),
        }
    }
}

/// Review-surface delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Review surface responded with status {0}")]
    Rejected(u16),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Ingest failed: {0}")]
    Ingest(#[from] IngestError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Draft generation failed: {0}")]
    Generation(#[from] GenerationFailed),

    #[error("Conversation {0} not found")]
    ConversationNotFound(String),

    #[error("Draft {0} not found")]
    DraftNotFound(String),

    #[error("Draft {id} is {status}, expected pending")]
    DraftNotPending { id: String, status: String },

    #[error("Conversation {0} has nothing to reply to")]
    NothingToReply(String),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
