//! Model registry.
//!
//! Static catalog of the models offered for deliberation, plus any local
//! models discovered at runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProviderError;

/// Provider family serving a model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gemini,
    OpenRouter,
    Perplexity,
    OpenAi,
    Local,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::Gemini,
        Provider::OpenRouter,
        Provider::Perplexity,
        Provider::OpenAi,
        Provider::Local,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Gemini => "Gemini",
            Provider::OpenRouter => "OpenRouter",
            Provider::Perplexity => "Perplexity",
            Provider::OpenAi => "OpenAI",
            Provider::Local => "Local",
        }
    }

    /// Catalog ids carry a routing prefix that the upstream API does not know about.
    fn catalog_prefixes(&self) -> &'static [&'static str] {
        match self {
            Provider::Gemini => &["gemini/"],
            Provider::OpenRouter => &["openrouter/"],
            Provider::Perplexity => &["perplexity/"],
            Provider::OpenAi => &["openai/", "chatgpt/"],
            Provider::Local => &["local/"],
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Rough price bracket shown next to a model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CostTier {
    Free,
    Cheap,
    Moderate,
    Expensive,
}

/// Catalog entry for a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelInfo {
    /// Identifier used throughout the store (e.g. "openrouter/xai/grok-4").
    pub id: String,
    /// Display name snapshotted into responses.
    pub name: String,
    pub provider: Provider,
    pub free: bool,
    pub cost_tier: CostTier,
    pub description: String,
}

impl ModelInfo {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider: Provider,
        cost_tier: CostTier,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider,
            free: cost_tier == CostTier::Free,
            cost_tier,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The model name the provider's API expects.
    pub fn upstream_id(&self) -> &str {
        self.provider
            .catalog_prefixes()
            .iter()
            .find_map(|prefix| self.id.strip_prefix(prefix))
            .unwrap_or(&self.id)
    }
}

/// Lookup table from model id to catalog entry.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Vec<ModelInfo>,
}

impl ModelRegistry {
    pub fn new(models: Vec<ModelInfo>) -> Self {
        Self { models }
    }

    /// Registry preloaded with the built-in catalog.
    pub fn builtin() -> Self {
        Self::new(builtin_catalog())
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.id == model_id)
    }

    pub fn resolve(&self, model_id: &str) -> Result<&ModelInfo, ProviderError> {
        self.get(model_id)
            .ok_or_else(|| ProviderError::UnknownModel(model_id.to_string()))
    }

    /// Display name for a model, falling back to the last path segment of its id.
    pub fn display_name(&self, model_id: &str) -> String {
        match self.get(model_id) {
            Some(info) => info.name.clone(),
            None => model_id
                .rsplit('/')
                .next()
                .unwrap_or(model_id)
                .to_string(),
        }
    }

    /// Add or replace an entry. Returns `true` when the id was new.
    pub fn register(&mut self, info: ModelInfo) -> bool {
        match self.models.iter_mut().find(|m| m.id == info.id) {
            Some(existing) => {
                *existing = info;
                false
            }
            None => {
                self.models.push(info);
                true
            }
        }
    }

    /// Register a model served by the local OpenAI-compatible server.
    pub fn register_local(&mut self, upstream_id: &str) -> String {
        let id = format!("local/{}", upstream_id);
        self.register(ModelInfo::new(
            id.clone(),
            upstream_id,
            Provider::Local,
            CostTier::Free,
        ));
        id
    }

    pub fn all(&self) -> &[ModelInfo] {
        &self.models
    }

    pub fn by_provider(&self, provider: Provider) -> impl Iterator<Item = &ModelInfo> {
        self.models.iter().filter(move |m| m.provider == provider)
    }

    pub fn free_models(&self) -> impl Iterator<Item = &ModelInfo> {
        self.models.iter().filter(|m| m.free)
    }
}

/// Built-in catalog, ordered by approximate benchmark ranking (highest first).
pub fn builtin_catalog() -> Vec<ModelInfo> {
    vec![
        ModelInfo::new(
            "openrouter/anthropic/claude-4.6-opus-thinking",
            "Claude 4.6 Opus Thinking",
            Provider::OpenRouter,
            CostTier::Expensive,
        )
        .with_description("Liderança em raciocínio lógico profundo."),
        ModelInfo::new(
            "openrouter/anthropic/claude-4.6-sonnet-thinking",
            "Claude 4.6 Sonnet Thinking",
            Provider::OpenRouter,
            CostTier::Expensive,
        )
        .with_description("Alto nível, mais rápido e fluente que os modelos Opus."),
        ModelInfo::new(
            "openai/gpt-5.2-high",
            "GPT-5.2 High",
            Provider::OpenAi,
            CostTier::Expensive,
        )
        .with_description("Matemática, lógica universal e análise de dados."),
        ModelInfo::new(
            "openai/gpt-5.2-codex",
            "GPT-5.2 Codex",
            Provider::OpenAi,
            CostTier::Expensive,
        )
        .with_description("Engenharia de software e refatoração massiva."),
        ModelInfo::new(
            "gemini-3-pro-preview-high",
            "Gemini 3 Pro Preview",
            Provider::Gemini,
            CostTier::Expensive,
        )
        .with_description("Contexto colossal e fluência multimodal."),
        ModelInfo::new(
            "gemini-3-flash-preview-high",
            "Gemini 3 Flash Preview",
            Provider::Gemini,
            CostTier::Free,
        )
        .with_description("Custo excepcional com bom seguimento de instruções."),
        ModelInfo::new(
            "openai/gpt-5-mini-high",
            "GPT-5 Mini High",
            Provider::OpenAi,
            CostTier::Cheap,
        )
        .with_description("Custo-benefício e baixíssima latência."),
        ModelInfo::new(
            "openrouter/moonshot/kimi-k2.5-thinking",
            "Kimi K2.5 Thinking",
            Provider::OpenRouter,
            CostTier::Cheap,
        )
        .with_description("Bom balanço custo/eficiência para raciocínio."),
        ModelInfo::new(
            "openrouter/deepseek/deepseek-v3.2-thinking",
            "DeepSeek V3.2 Thinking",
            Provider::OpenRouter,
            CostTier::Free,
        )
        .with_description("Custo extremamente baixo com boa lógica básica."),
        ModelInfo::new(
            "openrouter/xai/grok-4",
            "Grok 4",
            Provider::OpenRouter,
            CostTier::Expensive,
        )
        .with_description("Conhecimentos amplos e fatos em tempo real."),
        ModelInfo::new(
            "perplexity/sonar-reasoning-pro",
            "Sonar Reasoning Pro",
            Provider::Perplexity,
            CostTier::Expensive,
        )
        .with_description("Respostas fundamentadas com navegação ativa."),
        ModelInfo::new(
            "perplexity/sonar-pro",
            "Sonar Pro",
            Provider::Perplexity,
            CostTier::Moderate,
        )
        .with_description("Respostas rápidas fundamentadas por links da web."),
        ModelInfo::new(
            "openrouter/bytedance/doubao-seed-code",
            "Doubao Seed Code",
            Provider::OpenRouter,
            CostTier::Free,
        )
        .with_description("Programação focada com contexto de 256k."),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_id_strips_routing_prefix() {
        let registry = ModelRegistry::builtin();
        let grok = registry.get("openrouter/xai/grok-4").unwrap();
        assert_eq!(grok.upstream_id(), "xai/grok-4");

        let gemini = registry.get("gemini-3-pro-preview-high").unwrap();
        assert_eq!(gemini.upstream_id(), "gemini-3-pro-preview-high");

        let chatgpt = ModelInfo::new("chatgpt/gpt-5", "GPT-5", Provider::OpenAi, CostTier::Moderate);
        assert_eq!(chatgpt.upstream_id(), "gpt-5");
    }

    #[test]
    fn test_resolve_unknown_model() {
        let registry = ModelRegistry::builtin();
        let err = registry.resolve("nope/model").unwrap_err();
        assert_eq!(err, ProviderError::UnknownModel("nope/model".to_string()));
    }

    #[test]
    fn test_register_local_model() {
        let mut registry = ModelRegistry::default();
        let id = registry.register_local("qwen2.5-7b-instruct");
        assert_eq!(id, "local/qwen2.5-7b-instruct");

        let info = registry.get(&id).unwrap();
        assert_eq!(info.provider, Provider::Local);
        assert_eq!(info.upstream_id(), "qwen2.5-7b-instruct");
        assert!(info.free);

        // Registering again replaces rather than duplicates.
        registry.register_local("qwen2.5-7b-instruct");
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn test_display_name_fallback() {
        let registry = ModelRegistry::default();
        assert_eq!(registry.display_name("vendor/some-model"), "some-model");
    }

    #[test]
    fn test_free_models_filter() {
        let registry = ModelRegistry::builtin();
        assert!(registry.free_models().all(|m| m.cost_tier == CostTier::Free));
        assert!(registry.by_provider(Provider::Perplexity).count() >= 2);
    }
}
