//! Configuration module for loading TOML config files.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::DeliberationError;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub deliberation: DeliberationSettings,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

/// Engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliberationSettings {
    /// Upper bound for each provider call, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Models used when none are given on the command line.
    #[serde(default)]
    pub default_models: Vec<String>,
    #[serde(default)]
    pub default_judge: Option<String>,
}

impl Default for DeliberationSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_timeout_secs(),
            default_models: Vec::new(),
            default_judge: None,
        }
    }
}

impl DeliberationSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    55
}

/// Endpoint and credential for one provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    pub base_url: String,
}

impl ApiProviderConfig {
    fn with_base(base_url: &str) -> Self {
        Self {
            api_key: None,
            base_url: base_url.to_string(),
        }
    }
}

/// Per-provider endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_gemini")]
    pub gemini: ApiProviderConfig,
    #[serde(default = "default_openrouter")]
    pub openrouter: ApiProviderConfig,
    #[serde(default = "default_perplexity")]
    pub perplexity: ApiProviderConfig,
    #[serde(default = "default_openai")]
    pub openai: ApiProviderConfig,
    #[serde(default = "default_local")]
    pub local: ApiProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            gemini: default_gemini(),
            openrouter: default_openrouter(),
            perplexity: default_perplexity(),
            openai: default_openai(),
            local: default_local(),
        }
    }
}

fn default_gemini() -> ApiProviderConfig {
    ApiProviderConfig::with_base("https://generativelanguage.googleapis.com/v1beta")
}

fn default_openrouter() -> ApiProviderConfig {
    ApiProviderConfig::with_base("https://openrouter.ai/api/v1")
}

fn default_perplexity() -> ApiProviderConfig {
    ApiProviderConfig::with_base("https://api.perplexity.ai")
}

fn default_openai() -> ApiProviderConfig {
    ApiProviderConfig::with_base("https://api.openai.com/v1")
}

fn default_local() -> ApiProviderConfig {
    ApiProviderConfig::with_base("http://localhost:1234/v1")
}

/// System prompts configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptsConfig {
    /// System prompt sent to every participant.
    #[serde(default = "default_participant_prompt")]
    pub participant_prompt: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            participant_prompt: default_participant_prompt(),
        }
    }
}

fn default_participant_prompt() -> String {
    DEFAULT_PARTICIPANT_PROMPT.to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DeliberationError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| DeliberationError::ConfigError(format!("Failed to read config: {}", e)))?;

        Self::from_str(&content)
    }

    /// Load configuration from string content.
    pub fn from_str(content: &str) -> Result<Self, DeliberationError> {
        toml::from_str(content)
            .map_err(|e| DeliberationError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Apply credentials and base URLs from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`; values that are unset or blank are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let keyed = [
            ("GEMINI_API_KEY", &mut self.providers.gemini),
            ("OPENROUTER_API_KEY", &mut self.providers.openrouter),
            ("PERPLEXITY_API_KEY", &mut self.providers.perplexity),
            ("OPENAI_API_KEY", &mut self.providers.openai),
        ];
        for (env, provider) in keyed {
            if let Some(key) = lookup(env) {
                provider.api_key = Some(key);
            }
        }

        if let Some(base) = lookup("LOCAL_BASE_URL") {
            self.providers.local.base_url = base;
        }
        if let Some(base) = lookup("OPENAI_API_BASE").or_else(|| lookup("OPENAI_BASE_URL")) {
            self.providers.openai.base_url = base;
        }
        if let Some(secs) = lookup("DELIBERAI_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            self.deliberation.request_timeout_secs = secs;
        }

        self
    }
}

/// Default configuration embedded in the binary.
pub fn default_config() -> Config {
    Config {
        deliberation: DeliberationSettings::default(),
        providers: ProvidersConfig::default(),
        prompts: PromptsConfig::default(),
    }
}

const DEFAULT_PARTICIPANT_PROMPT: &str = r#"Você é um dos participantes de uma deliberação entre múltiplos modelos de IA.

Responda ao problema do usuário de forma independente e fundamentada.

Se mensagens de outros participantes forem apresentadas após o problema (marcadas com [Rodada N] e o nome do modelo), trate-as como a transcrição do debate até aqui:
- Avalie criticamente os argumentos apresentados
- Aponte falácias, erros ou lacunas
- Revise sua posição quando houver argumentos melhores, ou defenda-a com novas evidências

FORMATO OBRIGATÓRIO DA RESPOSTA:
## Análise
(seu raciocínio detalhado)

## Conclusão Final
(sua resposta final, direta e objetiva)
"#;
