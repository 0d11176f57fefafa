//! Provider adapters.
//!
//! Each adapter turns a generic `(model, messages)` call into one provider's
//! wire format. The [`AdapterRegistry`] maps a [`Provider`] to its adapter
//! and bounds every call with the configured timeout.

mod gemini;
mod openai_compat;

pub use gemini::GeminiAdapter;
pub use openai_compat::OpenAiCompatAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ProvidersConfig;
use crate::error::{DeliberationError, ProviderError};
use crate::models::{ModelInfo, Provider};

/// Author of a chat message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message sent to a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Availability of a provider, as reported by [`ProviderAdapter::status`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderStatus {
    pub available: bool,
    pub reason: Option<String>,
}

impl ProviderStatus {
    pub fn available() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

/// Boundary between the deliberation core and a provider's HTTP API.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Send `messages` to `model` (the upstream model name) and return the generated text.
    async fn invoke(&self, model: &str, messages: &[ChatMessage]) -> Result<String, ProviderError>;

    /// Cheap availability check. Defaults to available.
    async fn status(&self) -> ProviderStatus {
        ProviderStatus::available()
    }
}

const STATUS_CACHE_TTL: Duration = Duration::from_secs(60);

/// Provider → adapter mapping, chosen at configuration time.
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
    timeout: Duration,
    status_cache: Mutex<Option<(Instant, HashMap<Provider, ProviderStatus>)>>,
}

impl AdapterRegistry {
    /// Empty registry; every call is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            adapters: HashMap::new(),
            timeout,
            status_cache: Mutex::new(None),
        }
    }

    /// Registry with the HTTP adapters for every provider in `config`.
    pub fn from_config(config: &ProvidersConfig, timeout: Duration) -> Result<Self, DeliberationError> {
        let mut registry = Self::new(timeout);
        registry.register(
            Provider::Gemini,
            Arc::new(GeminiAdapter::new(&config.gemini, timeout)?),
        );
        for provider in [
            Provider::OpenRouter,
            Provider::Perplexity,
            Provider::OpenAi,
            Provider::Local,
        ] {
            let provider_config = match provider {
                Provider::OpenRouter => &config.openrouter,
                Provider::Perplexity => &config.perplexity,
                Provider::OpenAi => &config.openai,
                _ => &config.local,
            };
            registry.register(
                provider,
                Arc::new(OpenAiCompatAdapter::new(provider, provider_config, timeout)?),
            );
        }
        Ok(registry)
    }

    pub fn with_adapter(mut self, provider: Provider, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(provider, adapter);
        self
    }

    pub fn register(&mut self, provider: Provider, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(provider, adapter);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invoke the adapter serving `model`, bounded by the registry timeout.
    pub async fn invoke(
        &self,
        model: &ModelInfo,
        messages: &[ChatMessage],
    ) -> Result<String, ProviderError> {
        let adapter = self
            .adapters
            .get(&model.provider)
            .ok_or_else(|| ProviderError::Upstream {
                provider: model.provider.to_string(),
                detail: "no adapter configured".to_string(),
            })?;

        debug!(
            model = %model.id,
            provider = %model.provider,
            messages = messages.len(),
            "invoking provider"
        );

        match tokio::time::timeout(self.timeout, adapter.invoke(model.upstream_id(), messages)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(model = %model.id, "provider call timed out");
                Err(ProviderError::Timeout(self.timeout.as_secs()))
            }
        }
    }

    /// Availability of every registered provider, cached for a minute.
    pub async fn statuses(&self) -> HashMap<Provider, ProviderStatus> {
        let mut cache = self.status_cache.lock().await;
        if let Some((at, statuses)) = cache.as_ref() {
            if at.elapsed() < STATUS_CACHE_TTL {
                return statuses.clone();
            }
        }

        let mut join_set = tokio::task::JoinSet::new();
        for (provider, adapter) in &self.adapters {
            let provider = *provider;
            let adapter = Arc::clone(adapter);
            join_set.spawn(async move { (provider, adapter.status().await) });
        }

        let mut statuses = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((provider, status)) => {
                    statuses.insert(provider, status);
                }
                Err(e) => warn!("status check task failed: {}", e),
            }
        }

        *cache = Some((Instant::now(), statuses.clone()));
        statuses
    }
}
