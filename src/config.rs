//! Configuration types, read from the environment.
//!
//! Every loader takes a lookup closure so tests can supply variables without
//! touching the process environment. `from_env()` wraps it with `std::env::var`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::context::AssemblerConfig;
use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig, RetryPolicy};
use crate::pipeline::PipelineConfig;
use crate::stage::ClassifierConfig;

const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Bearer token for `/admin/*` and `/review/*`. Those routes refuse every
    /// request when unset.
    pub admin_secret: Option<SecretString>,
    /// Incoming-webhook URL of the chat-ops review channel.
    pub review_webhook_url: Option<String>,
    /// Directory for the daily rolling log file.
    pub log_dir: Option<PathBuf>,
}

/// The full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub db_path: PathBuf,
    pub llm: LlmConfig,
    pub classifier: ClassifierConfig,
    pub assembler: AssemblerConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let server = ServerConfig {
            bind_addr: parse_or(&get, "STL_BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            admin_secret: get("STL_ADMIN_SECRET").map(SecretString::from),
            review_webhook_url: get("STL_REVIEW_WEBHOOK_URL"),
            log_dir: get("STL_LOG_DIR").map(PathBuf::from),
        };

        let db_path = get("STL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/speed-to-lead.db"));

        Ok(Self {
            server,
            db_path,
            llm: llm_config(&get)?,
            classifier: ClassifierConfig {
                idle_threshold: chrono::Duration::days(parse_or(&get, "STL_IDLE_THRESHOLD_DAYS", 7i64)?),
                reroute_booked: parse_bool(&get, "STL_IDLE_REROUTE_BOOKED", false)?,
            },
            assembler: AssemblerConfig {
                budget_chars: parse_or(&get, "STL_CONTEXT_BUDGET_CHARS", 12_000usize)?,
                auto_include_priority: parse_or(&get, "STL_AUTO_INCLUDE_PRIORITY", 7i32)?,
            },
            pipeline: PipelineConfig {
                draft_stale_after: chrono::Duration::hours(parse_or(&get, "STL_DRAFT_STALE_HOURS", 48i64)?),
                ..PipelineConfig::default()
            },
        })
    }
}

fn llm_config(get: &impl Fn(&str) -> Option<String>) -> Result<LlmConfig, ConfigError> {
    let backend: LlmBackend = parse_or(get, "STL_LLM_BACKEND", LlmBackend::Anthropic)?;
    let (vendor_key, default_model) = match backend {
        LlmBackend::Anthropic => ("ANTHROPIC_API_KEY", DEFAULT_ANTHROPIC_MODEL),
        LlmBackend::OpenAi => ("OPENAI_API_KEY", DEFAULT_OPENAI_MODEL),
    };
    let api_key = get("STL_LLM_API_KEY")
        .or_else(|| get(vendor_key))
        .ok_or_else(|| ConfigError::MissingRequired {
            key: "STL_LLM_API_KEY".into(),
            hint: format!("set STL_LLM_API_KEY or {vendor_key}"),
        })?;

    Ok(LlmConfig {
        backend,
        api_key: SecretString::from(api_key),
        model: get("STL_LLM_MODEL").unwrap_or_else(|| default_model.to_string()),
        retry: RetryPolicy {
            timeout: Duration::from_secs(parse_or(get, "STL_LLM_TIMEOUT_SECS", 30u64)?),
            max_retries: parse_or(get, "STL_LLM_MAX_RETRIES", 2u32)?,
            base_delay_ms: parse_or(get, "STL_LLM_RETRY_BASE_MS", 500u64)?,
            max_delay_ms: parse_or(get, "STL_LLM_RETRY_MAX_MS", 8_000u64)?,
        },
    })
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool, ConfigError> {
    match get(key).map(|v| v.to_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{v}' is not a boolean"),
        }),
    }
}
