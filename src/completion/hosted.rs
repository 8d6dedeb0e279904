use super::{CompletionError, CompletionProvider, CompletionResult};
use crate::config::CompletionSettings;
use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers;
use tracing::debug;

const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-20241022";
const DEFAULT_OLLAMA_MODEL: &str = "llama3.1:latest";

/// Client for a hosted provider reached through Rig
enum ProviderClient {
    OpenAI(providers::openai::Client),
    Anthropic(providers::anthropic::Client),
    Ollama(providers::ollama::Client),
}

pub struct HostedProvider {
    client: ProviderClient,
    model: String,
    temperature: f64,
    max_tokens: u64,
    preamble: Option<String>,
}

impl HostedProvider {
    pub fn openai(api_key: &str, settings: &CompletionSettings) -> Self {
        Self::new(
            ProviderClient::OpenAI(providers::openai::Client::new(api_key)),
            settings
                .hosted_model
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            settings,
        )
    }

    pub fn anthropic(api_key: &str, settings: &CompletionSettings) -> Self {
        Self::new(
            ProviderClient::Anthropic(providers::anthropic::Client::new(api_key)),
            settings
                .hosted_model
                .clone()
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
            settings,
        )
    }

    /// Ollama endpoint is configured via the OLLAMA_HOST environment variable
    /// (defaults to http://localhost:11434).
    pub fn ollama(settings: &CompletionSettings) -> Self {
        Self::new(
            ProviderClient::Ollama(providers::ollama::Client::new()),
            settings
                .hosted_model
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string()),
            settings,
        )
    }

    fn new(client: ProviderClient, model: String, settings: &CompletionSettings) -> Self {
        Self {
            client,
            model,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            preamble: settings.system_prompt.clone(),
        }
    }

    fn provider_name(&self) -> &'static str {
        match self.client {
            ProviderClient::OpenAI(_) => "openai",
            ProviderClient::Anthropic(_) => "anthropic",
            ProviderClient::Ollama(_) => "ollama",
        }
    }
}

fn rejected(err: impl std::fmt::Display) -> CompletionError {
    CompletionError::ServerRejected(err.to_string())
}

#[async_trait]
impl CompletionProvider for HostedProvider {
    async fn generate(&self, prompt: &str) -> CompletionResult<String> {
        debug!(provider = self.provider_name(), model = %self.model, "requesting completion");
        let preamble = self.preamble.as_deref().unwrap_or_default();

        let reply = match &self.client {
            ProviderClient::OpenAI(client) => {
                let agent = client
                    .agent(&self.model)
                    .preamble(preamble)
                    .max_tokens(self.max_tokens)
                    .temperature(self.temperature)
                    .build();

                agent.prompt(prompt).await.map_err(rejected)?
            }
            ProviderClient::Anthropic(client) => {
                let agent = client
                    .agent(&self.model)
                    .preamble(preamble)
                    .max_tokens(self.max_tokens)
                    .temperature(self.temperature)
                    .build();

                agent.prompt(prompt).await.map_err(rejected)?
            }
            ProviderClient::Ollama(client) => {
                let agent = client
                    .agent(&self.model)
                    .preamble(preamble)
                    .temperature(self.temperature)
                    .build();

                agent.prompt(prompt).await.map_err(rejected)?
            }
        };

        Ok(reply.trim().to_string())
    }
}
