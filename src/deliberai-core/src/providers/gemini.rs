//! Adapter for the native Gemini `generateContent` API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ChatMessage, ProviderAdapter, ProviderStatus, Role};
use crate::config::ApiProviderConfig;
use crate::error::{DeliberationError, ProviderError};

pub struct GeminiAdapter {
    api_base: String,
    api_key: Option<String>,
    timeout: Duration,
    http_client: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl GeminiAdapter {
    pub fn new(config: &ApiProviderConfig, timeout: Duration) -> Result<Self, DeliberationError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                DeliberationError::ConfigError(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            api_base: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            timeout,
            http_client,
        })
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingCredential("GEMINI_API_KEY".to_string()))
    }

    /// The client timeout races the registry's; both mean the same thing.
    fn transport_error(&self, error: reqwest::Error) -> ProviderError {
        if error.is_timeout() {
            ProviderError::Timeout(self.timeout.as_secs())
        } else {
            ProviderError::Network(error.to_string())
        }
    }
}

/// Gemini takes the system prompt separately and calls the assistant "model".
fn build_request(messages: &[ChatMessage]) -> GenerateRequest {
    let system_text = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let contents = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| Content {
            role: Some(match m.role {
                Role::Assistant => "model".to_string(),
                _ => "user".to_string(),
            }),
            parts: vec![Part {
                text: m.content.clone(),
            }],
        })
        .collect();

    GenerateRequest {
        system_instruction: (!system_text.is_empty()).then(|| Content {
            role: None,
            parts: vec![Part { text: system_text }],
        }),
        contents,
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    async fn invoke(&self, model: &str, messages: &[ChatMessage]) -> Result<String, ProviderError> {
        let api_key = self.api_key()?;
        let url = format!("{}/models/{}:generateContent", self.api_base, model);

        let response = self
            .http_client
            .post(url)
            .query(&[("key", api_key)])
            .json(&build_request(messages))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::classify("Gemini", Some(status.as_u16()), &body));
        }

        let data: GenerateResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;

        Ok(data
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .map(|p| p.text)
            .unwrap_or_default())
    }

    async fn status(&self) -> ProviderStatus {
        let Ok(api_key) = self.api_key() else {
            return ProviderStatus::unavailable("GEMINI_API_KEY não configurada");
        };

        let check = self
            .http_client
            .get(format!("{}/models", self.api_base))
            .query(&[("key", api_key)])
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        match check {
            Ok(r) if r.status().is_success() => ProviderStatus::available(),
            Ok(r) if r.status().as_u16() == 400 || r.status().as_u16() == 403 => {
                ProviderStatus::unavailable("API Key Gemini inválida")
            }
            Ok(r) => ProviderStatus::unavailable(format!("Gemini indisponível ({})", r.status().as_u16())),
            Err(_) => ProviderStatus::unavailable("Não foi possível conectar ao Gemini"),
        }
    }
}
