//! DeliberAI Core Library
//!
//! Multi-round deliberation between several LLMs: every selected model
//! answers the same prompt, the user curates which answers feed the next
//! round, and the deliberation ends with a judge synthesis or a full
//! transcript.

pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod providers;
pub mod response;
pub mod selection;
pub mod store;
pub mod transcript;

#[cfg(test)]
mod test_support;

pub use auth::{AlwaysValid, OAuthSession, SessionGate};
pub use config::{Config, default_config};
pub use error::{DeliberationError, ProviderError};
pub use models::{CostTier, ModelInfo, ModelRegistry, Provider};
pub use providers::{AdapterRegistry, ChatMessage, ProviderAdapter, ProviderStatus, Role};
pub use response::Response;
pub use selection::SelectionSet;
pub use store::{
    ColumnStatus, DeliberationEvent, DeliberationSnapshot, DeliberationStatus, DeliberationStore,
    EventCallback, RoundSummary,
};
