//! Adapter for OpenAI-compatible chat completion APIs.
//!
//! Serves OpenAI, OpenRouter, Perplexity and local servers such as LM Studio.
//!
//! Requests are built with async-openai's types but sent on our own client:
//! one attempt per call, so the HTTP status of a 429 or 5xx reaches the
//! error classification instead of disappearing into a retry loop.

use async_openai::config::{Config as _, OpenAIConfig};
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{ChatMessage, ProviderAdapter, ProviderStatus, Role};
use crate::config::ApiProviderConfig;
use crate::error::{DeliberationError, ProviderError};
use crate::models::Provider;

const OPENROUTER_REFERER: &str = "http://localhost:3000";
const OPENROUTER_TITLE: &str = "LLM Deliberation System";

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

pub struct OpenAiCompatAdapter {
    provider: Provider,
    api_base: String,
    api_key: Option<String>,
    timeout: Duration,
    http_client: reqwest::Client,
}

#[derive(Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatAdapter {
    pub fn new(
        provider: Provider,
        config: &ApiProviderConfig,
        timeout: Duration,
    ) -> Result<Self, DeliberationError> {
        let mut headers = HeaderMap::new();
        if provider == Provider::OpenRouter {
            headers.insert("HTTP-Referer", HeaderValue::from_static(OPENROUTER_REFERER));
            headers.insert("X-Title", HeaderValue::from_static(OPENROUTER_TITLE));
        }

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                DeliberationError::ConfigError(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            provider,
            api_base: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            timeout,
            http_client,
        })
    }

    fn api_key(&self) -> Result<String, ProviderError> {
        match (&self.api_key, self.provider) {
            (Some(key), _) => Ok(key.clone()),
            // Local servers usually accept any key.
            (None, Provider::Local) => Ok(String::new()),
            (None, _) => Err(ProviderError::MissingCredential(key_env(self.provider).to_string())),
        }
    }

    /// Models currently served by the endpoint (`GET {base}/models`).
    ///
    /// Any failure yields an empty list; a local server being offline is normal.
    pub async fn list_models(&self) -> Vec<String> {
        #[derive(Deserialize)]
        struct ModelList {
            #[serde(default)]
            data: Vec<ModelEntry>,
        }

        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }

        let mut request = self
            .http_client
            .get(format!("{}/models", self.api_base))
            .timeout(Duration::from_secs(3));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(provider = %self.provider, status = %r.status(), "model listing refused");
                return Vec::new();
            }
            Err(e) => {
                debug!(provider = %self.provider, "model listing failed: {}", e);
                return Vec::new();
            }
        };

        response
            .json::<ModelList>()
            .await
            .map(|list| list.data.into_iter().map(|m| m.id).collect())
            .unwrap_or_default()
    }
}

fn to_request_message(message: &ChatMessage) -> ChatCompletionRequestMessage {
    match message.role {
        Role::System => ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
            content: message.content.clone().into(),
            name: None,
        }),
        Role::User => ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
            content: message.content.clone().into(),
            name: None,
        }),
        Role::Assistant => {
            ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                content: Some(message.content.clone().into()),
                name: None,
                tool_calls: None,
                refusal: None,
                audio: None,
                function_call: None,
            })
        }
    }
}

/// Map a non-success HTTP answer onto the provider error taxonomy.
fn classify_http_error(provider: Provider, status: u16, body: &str) -> ProviderError {
    let lower = body.to_lowercase();
    if status == 401 || lower.contains("invalid_api_key") || lower.contains("incorrect api key") {
        return ProviderError::Upstream {
            provider: provider.to_string(),
            detail: format!("{} inválida.", key_env(provider)),
        };
    }
    ProviderError::classify(provider.display_name(), Some(status), body)
}

fn transport_error(error: &reqwest::Error, timeout: Duration) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(timeout.as_secs())
    } else {
        ProviderError::Network(error.to_string())
    }
}

/// Environment variable holding a provider's key.
fn key_env(provider: Provider) -> &'static str {
    match provider {
        Provider::OpenAi => "OPENAI_API_KEY",
        Provider::OpenRouter => "OPENROUTER_API_KEY",
        Provider::Perplexity => "PERPLEXITY_API_KEY",
        Provider::Gemini => "GEMINI_API_KEY",
        Provider::Local => "LOCAL_API_KEY",
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    async fn invoke(&self, model: &str, messages: &[ChatMessage]) -> Result<String, ProviderError> {
        let config = OpenAIConfig::new()
            .with_api_key(self.api_key()?)
            .with_api_base(&self.api_base);

        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(messages.iter().map(to_request_message).collect::<Vec<_>>())
            .build()
            .map_err(|e| ProviderError::Upstream {
                provider: self.provider.to_string(),
                detail: e.to_string(),
            })?;

        let response = self
            .http_client
            .post(config.url(CHAT_COMPLETIONS_PATH))
            .headers(config.headers())
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(&e, self.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(&e, self.timeout))?;
        if !status.is_success() {
            debug!(provider = %self.provider, status = %status, "chat completion refused");
            return Err(classify_http_error(self.provider, status.as_u16(), &body));
        }

        // Some gateways report failures inside a 200 body.
        let completion: CompletionBody = serde_json::from_str(&body)
            .map_err(|_| ProviderError::classify(self.provider.display_name(), None, &body))?;
        if completion.choices.is_empty() && body.contains("\"error\"") {
            return Err(ProviderError::classify(self.provider.display_name(), None, &body));
        }

        Ok(completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn status(&self) -> ProviderStatus {
        match self.provider {
            Provider::Local => {
                let check = self
                    .http_client
                    .get(format!("{}/models", self.api_base))
                    .timeout(Duration::from_secs(2))
                    .send()
                    .await;
                match check {
                    Ok(r) if r.status().is_success() => ProviderStatus::available(),
                    Ok(_) => ProviderStatus::unavailable("Servidor local não respondeu"),
                    Err(_) => ProviderStatus::unavailable("Servidor local offline (LM Studio)"),
                }
            }
            _ => {
                let Some(key) = &self.api_key else {
                    return ProviderStatus::unavailable(format!(
                        "{} não configurada",
                        key_env(self.provider)
                    ));
                };
                let expected_prefix = match self.provider {
                    Provider::OpenAi => Some("sk-"),
                    Provider::Perplexity => Some("pplx-"),
                    _ => None,
                };
                match expected_prefix {
                    Some(prefix) if !key.starts_with(prefix) => ProviderStatus::unavailable(
                        format!("{} formato inválido", key_env(self.provider)),
                    ),
                    _ => ProviderStatus::available(),
                }
            }
        }
    }
}
