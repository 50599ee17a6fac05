//! Model provider integration.
//!
//! The pipeline consumes the two capabilities behind trait objects; the
//! OpenAI-compatible client implements both, so one configured endpoint
//! serves completions and embeddings.

pub mod openai;
pub mod provider;

pub use openai::OpenAiClient;
pub use provider::*;

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Create the completion and embedding handles from configuration.
pub fn create_models(
    config: &LlmConfig,
) -> Result<(Arc<dyn CompletionModel>, Arc<dyn EmbeddingModel>), LlmError> {
    let client = Arc::new(OpenAiClient::new(config)?);
    tracing::info!(
        chat_model = %config.chat_model,
        embed_model = %config.embed_model,
        "Model provider configured"
    );
    Ok((client.clone(), client))
}
