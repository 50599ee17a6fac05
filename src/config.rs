//! Configuration types.
//!
//! Everything is read from `ZAPDESK_*` environment variables at startup.
//! Secrets go through `secrecy` so they never land in debug output.

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default persona instruction for grounded replies.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful customer support assistant. \
     Answer in the language the customer writes in. Be concise and friendly. \
     When reference material is provided, ground your answer in it and do not invent details.";

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Address the webhook server binds to.
    pub bind_addr: String,
    /// Shared secret the gateway must present in the `apikey` header.
    pub webhook_secret: SecretString,
    /// Path to the local database file.
    pub db_path: String,
    /// Outbound gateway settings.
    pub gateway: GatewayConfig,
    /// Model provider settings.
    pub llm: LlmConfig,
    /// Retrieval settings.
    pub rag: RagConfig,
    /// Tolerated backwards clock skew for inbound message timestamps, seconds.
    pub skew_tolerance_secs: i64,
}

/// Settings for the WhatsApp session bridge.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the bridge, e.g. `http://localhost:8085`.
    pub base_url: String,
    /// API key sent in the `apikey` header on every call.
    pub api_key: SecretString,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

/// Settings for the embedding/completion provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API.
    pub base_url: String,
    pub api_key: SecretString,
    /// Chat completion model name.
    pub chat_model: String,
    /// Embedding model name.
    pub embed_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum retries for rate-limit/server errors.
    pub max_retries: u32,
}

/// Retrieval tuning.
#[derive(Debug, Clone)]
pub struct RagConfig {
    /// Minimum cosine similarity for a knowledge entry to be used.
    pub similarity_threshold: f32,
    /// Maximum number of entries in the context block.
    pub top_k: usize,
    /// Persona/system instruction for the completion call.
    pub system_prompt: String,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            top_k: 5,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: SecretString::from(""),
            chat_model: "gpt-4o-mini".to_string(),
            embed_model: "text-embedding-3-small".to_string(),
            temperature: 0.4,
            max_tokens: 1024,
            timeout_secs: 60,
            max_retries: 3,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> std::result::Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

impl AppConfig {
    /// Build the full configuration from environment variables.
    ///
    /// Required: `ZAPDESK_WEBHOOK_SECRET`, `ZAPDESK_GATEWAY_URL`,
    /// `ZAPDESK_GATEWAY_API_KEY`, `ZAPDESK_LLM_API_KEY`.
    /// Everything else has a sensible default.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        let rag = RagConfig {
            similarity_threshold: env_parse("ZAPDESK_RAG_THRESHOLD", 0.7),
            top_k: env_parse("ZAPDESK_RAG_TOP_K", 5),
            system_prompt: env_or("ZAPDESK_SYSTEM_PROMPT", DEFAULT_SYSTEM_PROMPT),
        };
        if !(0.0..=1.0).contains(&rag.similarity_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "ZAPDESK_RAG_THRESHOLD".into(),
                message: "must be between 0.0 and 1.0".into(),
            });
        }

        let defaults = LlmConfig::default();
        Ok(Self {
            bind_addr: env_or("ZAPDESK_BIND_ADDR", "0.0.0.0:3000"),
            webhook_secret: SecretString::from(env_required("ZAPDESK_WEBHOOK_SECRET")?),
            db_path: env_or("ZAPDESK_DB_PATH", "./data/zapdesk.db"),
            gateway: GatewayConfig {
                base_url: env_required("ZAPDESK_GATEWAY_URL")?,
                api_key: SecretString::from(env_required("ZAPDESK_GATEWAY_API_KEY")?),
                timeout_secs: env_parse("ZAPDESK_GATEWAY_TIMEOUT_SECS", 30),
            },
            llm: LlmConfig {
                base_url: env_or("ZAPDESK_LLM_URL", &defaults.base_url),
                api_key: SecretString::from(env_required("ZAPDESK_LLM_API_KEY")?),
                chat_model: env_or("ZAPDESK_CHAT_MODEL", &defaults.chat_model),
                embed_model: env_or("ZAPDESK_EMBED_MODEL", &defaults.embed_model),
                temperature: env_parse("ZAPDESK_TEMPERATURE", defaults.temperature),
                max_tokens: env_parse("ZAPDESK_MAX_TOKENS", defaults.max_tokens),
                timeout_secs: env_parse("ZAPDESK_LLM_TIMEOUT_SECS", defaults.timeout_secs),
                max_retries: env_parse("ZAPDESK_LLM_MAX_RETRIES", defaults.max_retries),
            },
            rag,
            skew_tolerance_secs: env_parse("ZAPDESK_SKEW_TOLERANCE_SECS", 5),
        })
    }
}
