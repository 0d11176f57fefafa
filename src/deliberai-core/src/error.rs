//! Error types for the deliberation system.

use thiserror::Error;

use crate::store::DeliberationStatus;

/// Failure of a single provider call.
///
/// The `Display` text is what ends up in a response's `error` field, so it is
/// written for the person reading the column, not for a log file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{0} não configurada")]
    MissingCredential(String),

    #[error("Modelo desconhecido: {0}")]
    UnknownModel(String),

    #[error("Limite de requisições ou créditos esgotados ({provider}): {detail}")]
    RateLimited { provider: String, detail: String },

    #[error("O servidor de {0} está sobrecarregado no momento. Tente novamente em instantes.")]
    Overloaded(String),

    #[error(
        "O contexto do debate excede o limite do modelo. Tente reduzir o número de rodadas anteriores ou a seleção de respostas."
    )]
    ContextLengthExceeded,

    #[error("Tempo limite excedido após {0}s")]
    Timeout(u64),

    #[error("Erro de rede: {0}")]
    Network(String),

    #[error("Sessão inválida ou expirada. Faça login novamente.")]
    AuthRequired,

    #[error("{provider} Error: {detail}")]
    Upstream { provider: String, detail: String },
}

impl ProviderError {
    /// Whether retrying the same call without changing anything can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::MissingCredential(_)
            | ProviderError::UnknownModel(_)
            | ProviderError::ContextLengthExceeded
            | ProviderError::AuthRequired => false,
            ProviderError::RateLimited { .. }
            | ProviderError::Overloaded(_)
            | ProviderError::Timeout(_)
            | ProviderError::Network(_)
            | ProviderError::Upstream { .. } => true,
        }
    }

    /// Classify an upstream failure from its HTTP status (when known) and body text.
    pub fn classify(provider: &str, status: Option<u16>, body: &str) -> Self {
        let lower = body.to_lowercase();

        if lower.contains("context length")
            || lower.contains("context_length_exceeded")
            || lower.contains("tokens to keep")
            || lower.contains("maximum context")
        {
            return ProviderError::ContextLengthExceeded;
        }

        if status == Some(503) || lower.contains("\"unavailable\"") || lower.contains("overloaded")
        {
            return ProviderError::Overloaded(provider.to_string());
        }

        if status == Some(429)
            || status == Some(402)
            || lower.contains("quota")
            || lower.contains("resource_exhausted")
            || lower.contains("credits")
            || lower.contains("rate limit")
        {
            return ProviderError::RateLimited {
                provider: provider.to_string(),
                detail: extract_message(body),
            };
        }

        ProviderError::Upstream {
            provider: provider.to_string(),
            detail: extract_message(body),
        }
    }
}

/// Pull `error.message` (or `detail`) out of a JSON error body, falling back to the raw text.
fn extract_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("detail"))
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Errors returned by deliberation store operations.
#[derive(Error, Debug)]
pub enum DeliberationError {
    #[error("Prompt cannot be empty")]
    EmptyPrompt,

    #[error("At least one model must be selected")]
    NoModelsSelected,

    #[error("Operation not allowed while status is {0:?}")]
    InvalidStatus(DeliberationStatus),

    #[error("No responses selected")]
    EmptySelection,

    #[error("No eligible models left for the next round")]
    NoEligibleModels,

    #[error("A synthesis request is already in flight")]
    JudgeInFlight,

    #[error("The deliberation was reset while this operation was running")]
    Superseded,

    #[error("Authentication required")]
    AuthRequired,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Authentication flow error: {0}")]
    AuthFlow(String),
}
