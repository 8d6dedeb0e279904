use super::{CompletionError, CompletionProvider, CompletionResult};
use crate::config::CompletionSettings;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Chat completions over any OpenAI-compatible HTTP endpoint.
pub struct EndpointProvider {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    max_tokens: u64,
    top_p: f64,
    system_prompt: Option<String>,
}

impl EndpointProvider {
    pub fn new(endpoint: String, settings: &CompletionSettings) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            top_p: settings.top_p,
            system_prompt: settings.system_prompt.clone(),
        }
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<RequestMessage<'a>>,
    temperature: f64,
    max_tokens: u64,
    top_p: f64,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseOpenAIShape {
    choices: Vec<ResponseChoice>,
}

#[derive(Deserialize)]
struct ResponseContentOnly {
    content: String,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Interprets a completion response body.
///
/// An `error.message` body is a rejection regardless of status. Successful
/// bodies may be OpenAI-shaped, `{ content }`, or plain text.
pub fn parse_completion_body(success: bool, status: u16, body: &str) -> CompletionResult<String> {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return Err(CompletionError::ServerRejected(parsed.error.message));
    }
    if !success {
        return Err(CompletionError::ServerRejected(format!(
            "status {status}: {body}"
        )));
    }

    if let Ok(parsed) = serde_json::from_str::<ResponseOpenAIShape>(body) {
        return match parsed.choices.into_iter().next() {
            Some(choice) => Ok(choice.message.content.trim().to_string()),
            None => Err(CompletionError::ServerRejected("empty response".to_string())),
        };
    }
    if let Ok(parsed) = serde_json::from_str::<ResponseContentOnly>(body) {
        return Ok(parsed.content.trim().to_string());
    }
    if serde_json::from_str::<serde_json::Value>(body).is_ok() {
        return Err(CompletionError::ServerRejected(
            "unrecognized response shape".to_string(),
        ));
    }

    Ok(body.trim().to_string())
}

#[async_trait]
impl CompletionProvider for EndpointProvider {
    async fn generate(&self, prompt: &str) -> CompletionResult<String> {
        let api_key = match &self.api_key {
            Some(key) if !key.trim().is_empty() => key,
            _ => return Err(CompletionError::MissingCredential),
        };
        let url = Url::parse(&self.endpoint)
            .map_err(|_| CompletionError::InvalidEndpoint(self.endpoint.clone()))?;

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system_prompt {
            messages.push(RequestMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(RequestMessage {
            role: "user",
            content: prompt,
        });

        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .json(&CompletionRequest {
                model: &self.model,
                messages,
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                top_p: self.top_p,
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        debug!(%status, model = %self.model, "completion endpoint responded");
        parse_completion_body(status.is_success(), status.as_u16(), &body)
    }
}
