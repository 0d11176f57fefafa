//! Console rendering of deliberation state and events.

use colored::Colorize;
use deliberai_core::{
    ColumnStatus, DeliberationEvent, DeliberationSnapshot, DeliberationStatus, EventCallback,
    ModelRegistry, Response,
};
use std::sync::Arc;

const WIDTH: usize = 70;

pub fn banner(title: &str) {
    println!();
    println!("{}", "═".repeat(WIDTH).bright_blue());
    println!("{}", format!("  {}", title).bright_blue().bold());
    println!("{}", "═".repeat(WIDTH).bright_blue());
}

pub fn rule() {
    println!("{}", "─".repeat(WIDTH).dimmed());
}

/// Prints store events as they happen.
pub fn event_printer(models: ModelRegistry) -> EventCallback {
    Arc::new(move |event| match event {
        DeliberationEvent::RoundStarted { round, models: ids } => {
            println!();
            println!(
                "{} {}",
                format!("▶ Rodada {}", round).bright_magenta().bold(),
                format!("({} modelos)", ids.len()).dimmed()
            );
        }
        DeliberationEvent::ColumnUpdated {
            model_id, status, ..
        } => {
            let name = models.display_name(&model_id);
            match status {
                ColumnStatus::Success => println!("  {} {}", "✓".green(), name.bright_cyan()),
                ColumnStatus::Error => println!("  {} {}", "✗".red(), name.bright_cyan()),
                _ => {}
            }
        }
        DeliberationEvent::RoundSettled(summary) => {
            if summary.all_failed() {
                println!(
                    "{}",
                    "  Todos os modelos falharam nesta rodada.".red().bold()
                );
            } else {
                println!(
                    "  {}",
                    format!("{} ok, {} com erro", summary.succeeded, summary.failed).dimmed()
                );
            }
        }
        DeliberationEvent::JudgeStarted { model_id } => {
            println!();
            println!(
                "{} {}",
                "⚖ Juiz:".yellow().bold(),
                models.display_name(&model_id).bright_cyan()
            );
        }
        DeliberationEvent::JudgeFinished { success } => {
            if !success {
                println!("{}", "  A síntese falhou.".red());
            }
        }
        DeliberationEvent::Completed => {}
        DeliberationEvent::AuthRequired => {
            println!(
                "{}",
                "Sessão expirada e não foi possível renová-la. Reinicie com `deliberai run --oauth`.".yellow()
            );
        }
    })
}

/// Selectable responses in the order they are numbered on screen.
pub fn numbered(snapshot: &DeliberationSnapshot) -> Vec<&Response> {
    let mut responses: Vec<&Response> = snapshot.valid_responses().collect();
    responses.sort_by_key(|r| r.round);
    responses
}

/// Render the current round, column by column.
pub fn render_round(snapshot: &DeliberationSnapshot) {
    println!();
    rule();
    for model_id in snapshot.columns.keys() {
        let Some(response) = snapshot
            .column(model_id)
            .into_iter()
            .rev()
            .find(|r| r.round == snapshot.round)
        else {
            continue;
        };
        println!(
            "{} {}",
            response.model_name.bright_cyan().bold(),
            format!("({:.1}s)", response.duration_ms as f64 / 1000.0).dimmed()
        );
        match &response.error {
            Some(error) => println!("  {}", error.red()),
            None => {
                if !response.analysis.is_empty() {
                    println!("{}", "  Análise".bold());
                    print_indented(&response.analysis);
                }
                println!("{}", "  Conclusão Final".bold());
                print_indented(&response.conclusion);
            }
        }
        rule();
    }
}

/// List every selectable response with its selection marker.
pub fn render_selection(snapshot: &DeliberationSnapshot) {
    println!();
    println!("{}", "Respostas:".bold());
    for (i, response) in numbered(snapshot).iter().enumerate() {
        let marker = if snapshot.selection.contains(&response.id) {
            "[x]".green()
        } else {
            "[ ]".normal()
        };
        println!(
            "  {:>2}. {} R{} {}",
            i + 1,
            marker,
            response.round,
            response.model_name.bright_cyan()
        );
    }
    println!(
        "  {}",
        format!("Modelos ativos: {}", snapshot.models.join(", ")).dimmed()
    );
}

pub fn render_result(title: &str, body: &str) {
    banner(title);
    println!();
    println!("{}", body);
}

pub fn status_label(status: DeliberationStatus) -> &'static str {
    match status {
        DeliberationStatus::Idle => "ociosa",
        DeliberationStatus::Loading => "carregando",
        DeliberationStatus::Deliberating => "em deliberação",
        DeliberationStatus::Completed => "concluída",
    }
}

fn print_indented(text: &str) {
    for line in text.lines() {
        println!("    {}", line);
    }
}
