//! Response records.
//!
//! One record per model per round, created when the adapter call resolves.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use uuid::Uuid;

/// Header the participant prompt asks models to put before their reasoning.
pub const ANALYSIS_HEADER: &str = "## Análise";
/// Header the participant prompt asks models to put before their final answer.
pub const CONCLUSION_HEADER: &str = "## Conclusão Final";

/// One model's answer for one round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    pub id: String,
    pub round: u32,
    pub model_id: String,
    /// Display name at the time the response was produced.
    pub model_name: String,
    pub analysis: String,
    pub conclusion: String,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl Response {
    /// Build a successful response from raw model output.
    pub fn success(
        round: u32,
        model_id: impl Into<String>,
        model_name: impl Into<String>,
        raw_text: &str,
        duration_ms: u64,
    ) -> Self {
        let (analysis, conclusion) = split_sections(&sanitize_response(raw_text));
        Self {
            id: Uuid::new_v4().to_string(),
            round,
            model_id: model_id.into(),
            model_name: model_name.into(),
            analysis,
            conclusion,
            duration_ms,
            error: None,
        }
    }

    pub fn failure(
        round: u32,
        model_id: impl Into<String>,
        model_name: impl Into<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            round,
            model_id: model_id.into(),
            model_name: model_name.into(),
            analysis: String::new(),
            conclusion: String::new(),
            duration_ms,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

static REASONING_TAGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(think|thinking|reflection|reasoning|scratchpad)[^>]*>.*?</(think|thinking|reflection|reasoning|scratchpad)>")
        .expect("reasoning tag pattern is valid")
});

static SECTION_HEADERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^#{1,4}\s*(an[aá]lise|conclus[aã]o final|conclus[aã]o)\s*:?\s*$")
        .expect("section header pattern is valid")
});

/// Strip reasoning blocks that some models emit before their answer.
///
/// Unlike spoken output, markdown structure is kept intact.
pub fn sanitize_response(response: &str) -> String {
    REASONING_TAGS.replace_all(response, "").trim().to_string()
}

/// Split model output into `(analysis, conclusion)`.
///
/// Without recognizable headers the whole text is treated as the conclusion.
pub fn split_sections(text: &str) -> (String, String) {
    let mut analysis: Option<String> = None;
    let mut conclusion: Option<String> = None;

    let headers: Vec<_> = SECTION_HEADERS.captures_iter(text).collect();
    for (i, caps) in headers.iter().enumerate() {
        let (Some(whole), Some(label)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let body_end = headers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(text.len());
        let body = text[whole.end()..body_end].trim().to_string();

        if label.as_str().to_lowercase().starts_with("an") {
            analysis.get_or_insert(body);
        } else {
            conclusion.get_or_insert(body);
        }
    }

    match (analysis, conclusion) {
        (None, None) => (String::new(), text.trim().to_string()),
        (analysis, conclusion) => (analysis.unwrap_or_default(), conclusion.unwrap_or_default()),
    }
}
