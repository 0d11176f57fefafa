//! Transcript assembly.
//!
//! Pure functions turning the response history and the selection set into
//! the context for the next round, the judge prompt, and Markdown documents.
//! Same input always yields byte-identical output.

use std::collections::BTreeMap;

use crate::providers::ChatMessage;
use crate::response::Response;
use crate::selection::SelectionSet;

pub const EXPORT_TITLE: &str = "# Deliberação Assistida por LLMs";

/// Instruction given to the judge model. The two headers are a contract with
/// downstream consumers and must not change.
pub const JUDGE_PROMPT: &str = "Você é um Juiz Especialista independente. Abaixo está o problema original e os argumentos de múltiplos modelos de IA que debateram a questão. Você NÃO participou do debate. Analise os argumentos, avalie qual lado possui a lógica mais fundamentada, corrija eventuais falácias e forneça a Resposta Final Definitiva. Estruture sua resposta com '## Avaliação do Debate' e '## Veredito Final'.";

/// Prompt for the synthesis call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisPrompt {
    pub system: String,
    pub user: String,
}

impl SynthesisPrompt {
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(self.system.clone()),
            ChatMessage::user(self.user.clone()),
        ]
    }
}

/// Selected, non-error responses ordered by round, then by position in history.
fn selected_in_history_order<'a>(
    responses: &'a [Response],
    selection: &SelectionSet,
) -> Vec<&'a Response> {
    let mut selected: Vec<&Response> = responses
        .iter()
        .filter(|r| !r.is_error() && selection.contains(&r.id))
        .collect();
    // Stable sort keeps history order within a round.
    selected.sort_by_key(|r| r.round);
    selected
}

/// Selected, non-error responses ordered by round, then by selection order.
fn selected_in_selection_order<'a>(
    responses: &'a [Response],
    selection: &SelectionSet,
) -> Vec<&'a Response> {
    let mut selected: Vec<&Response> = selection
        .iter()
        .filter_map(|id| responses.iter().find(|r| &r.id == id))
        .filter(|r| !r.is_error())
        .collect();
    selected.sort_by_key(|r| r.round);
    selected
}

/// One debate transcript entry as the other participants see it.
fn transcript_entry(response: &Response) -> String {
    format!(
        "[Rodada {}] {}:\n### Análise\n{}\n\n### Conclusão Final\n{}",
        response.round, response.model_name, response.analysis, response.conclusion
    )
}

/// Context for the next round: system prompt, original prompt, then one
/// message per selected response.
pub fn next_round_context(
    system_prompt: &str,
    prompt: &str,
    responses: &[Response],
    selection: &SelectionSet,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_prompt), ChatMessage::user(prompt)];
    messages.extend(
        selected_in_history_order(responses, selection)
            .into_iter()
            .map(|r| ChatMessage::user(transcript_entry(r))),
    );
    messages
}

/// Debate transcript text restricted to the selected responses.
pub fn debate_transcript(responses: &[Response], selection: &SelectionSet) -> String {
    selected_in_history_order(responses, selection)
        .into_iter()
        .map(transcript_entry)
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// Judge prompt over the selected responses.
pub fn synthesis_prompt(
    prompt: &str,
    responses: &[Response],
    selection: &SelectionSet,
) -> SynthesisPrompt {
    SynthesisPrompt {
        system: JUDGE_PROMPT.to_string(),
        user: format!(
            "Problema original: {}\n\n[DEBATE]\n{}",
            prompt,
            debate_transcript(responses, selection)
        ),
    }
}

fn push_entry(out: &mut String, response: &Response) {
    out.push_str(&format!("### {}\n\n", response.model_name));
    out.push_str(&format!("#### Análise\n{}\n\n", response.analysis));
    out.push_str(&format!("#### Conclusão Final\n{}\n\n", response.conclusion));
    out.push_str("---\n\n");
}

fn push_rounds(out: &mut String, grouped: &BTreeMap<u32, Vec<&Response>>) {
    for (round, entries) in grouped {
        out.push_str(&format!("## Rodada {}\n\n", round));
        for response in entries {
            push_entry(out, response);
        }
    }
}

fn group_by_round<'a>(responses: impl IntoIterator<Item = &'a Response>) -> BTreeMap<u32, Vec<&'a Response>> {
    let mut grouped: BTreeMap<u32, Vec<&Response>> = BTreeMap::new();
    for response in responses {
        grouped.entry(response.round).or_default().push(response);
    }
    grouped
}

/// Selected responses reproduced in full, grouped by round then selection order.
pub fn full_transcript(responses: &[Response], selection: &SelectionSet) -> String {
    let mut out = String::new();
    push_rounds(
        &mut out,
        &group_by_round(selected_in_selection_order(responses, selection)),
    );
    out.trim_end().to_string()
}

/// Markdown export of every non-error response, with any finalization results.
pub fn export_markdown(
    responses: &[Response],
    synthesis: Option<&str>,
    full_transcript: Option<&str>,
) -> String {
    let mut out = format!("{}\n\n", EXPORT_TITLE);
    push_rounds(
        &mut out,
        &group_by_round(responses.iter().filter(|r| !r.is_error())),
    );

    if let Some(synthesis) = synthesis {
        out.push_str(&format!("## Síntese Final\n\n{}\n\n", synthesis));
    }
    if let Some(transcript) = full_transcript {
        out.push_str(&format!("## Transcrição Integral\n\n{}\n\n", transcript));
    }
    out
}

/// Suggested file name for an export.
pub fn export_file_name(responses: &[Response]) -> String {
    format!("deliberacao-rodadas-{}.md", group_by_round(responses).len())
}
