/// Completion module for chatvault
///
/// Generates the assistant reply that follows every persisted user message.
/// Providers are selected from configuration in priority order:
///
/// - `endpoint` - any OpenAI-compatible chat completions URL
/// - `hosted` - OpenAI, Anthropic or Ollama through Rig
/// - `StaticReply` - a fixed reply for offline use
///
/// # Usage
///
/// ```rust,no_run
/// use chatvault::completion::{self, CompletionProvider};
/// use chatvault::config::Config;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = Config::from_env()?;
/// let provider = completion::from_settings(&config.completion)?;
/// let reply = provider.generate("Hello!").await?;
/// # Ok(())
/// # }
/// ```
mod endpoint;
mod hosted;

use crate::config::CompletionSettings;
use async_trait::async_trait;
use std::sync::Arc;

pub use endpoint::{EndpointProvider, parse_completion_body};
pub use hosted::HostedProvider;

// ============================================
// Error Types
// ============================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompletionError {
    #[error("no API credential configured for the completion service")]
    MissingCredential,

    #[error("invalid completion endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("completion service rejected the request: {0}")]
    ServerRejected(String),

    #[error("completion transport failed: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for CompletionError {
    fn from(err: reqwest::Error) -> Self {
        CompletionError::Transport(err.to_string())
    }
}

pub type CompletionResult<T> = Result<T, CompletionError>;

/// Text-in, text-out generation.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn generate(&self, prompt: &str) -> CompletionResult<String>;
}

/// Always answers with the same text.
pub struct StaticReply {
    reply: String,
}

impl StaticReply {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

#[async_trait]
impl CompletionProvider for StaticReply {
    async fn generate(&self, _prompt: &str) -> CompletionResult<String> {
        Ok(self.reply.clone())
    }
}

/// Picks a provider from configuration.
///
/// Priority order:
/// 1. `COMPLETION_ENDPOINT` → OpenAI-compatible endpoint
/// 2. `OPENAI_API_KEY` → OpenAI
/// 3. `ANTHROPIC_API_KEY` → Anthropic
/// 4. `LLM_USE_OLLAMA=true` → Ollama
/// 5. `COMPLETION_STATIC_REPLY` → fixed reply
pub fn from_settings(
    settings: &CompletionSettings,
) -> CompletionResult<Arc<dyn CompletionProvider>> {
    if let Some(endpoint) = &settings.endpoint {
        return Ok(Arc::new(EndpointProvider::new(endpoint.clone(), settings)));
    }
    if let Some(key) = &settings.openai_api_key {
        return Ok(Arc::new(HostedProvider::openai(key, settings)));
    }
    if let Some(key) = &settings.anthropic_api_key {
        return Ok(Arc::new(HostedProvider::anthropic(key, settings)));
    }
    if settings.use_ollama {
        return Ok(Arc::new(HostedProvider::ollama(settings)));
    }
    if let Some(reply) = &settings.static_reply {
        return Ok(Arc::new(StaticReply::new(reply.clone())));
    }
    Err(CompletionError::MissingCredential)
}
