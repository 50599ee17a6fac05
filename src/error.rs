//! Error types for zapdesk.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

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

/// Errors from the outbound messaging gateway (the WhatsApp session bridge).
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway send to {phone} failed: {reason}")]
    SendFailed { phone: String, reason: String },

    #[error("Gateway request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Gateway rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Model provider errors (embedding and completion capabilities).
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pipeline stage errors.
///
/// One variant per failure class in the stage contracts. The coordinator
/// pattern-matches on these to decide continue/stop; no failure here ever
/// propagates past the webhook handler boundary.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Unparseable inbound payload. Logged and dropped, never retried.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Store failure at a stage where the event cannot continue.
    #[error("Store error during {stage}: {source}")]
    Store {
        stage: &'static str,
        source: DatabaseError,
    },

    /// A matched rule's action failed to execute. Degrades to the RAG path.
    #[error("Automation action failed: {0}")]
    Automation(String),

    /// Embedding or completion call failed; no reply is dispatched.
    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    /// Gateway send failed; the inbound message stays persisted, no outbound
    /// row is written.
    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] GatewayError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
