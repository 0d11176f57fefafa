//! DeliberAI CLI - multi-model deliberation tool
//!
//! Sends one prompt to several LLMs, lets the user curate which answers
//! feed the next round, and ends with a judge verdict or a full transcript.

mod console;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use colored::Colorize;
use deliberai_core::auth::CallbackListener;
use deliberai_core::config::{Config, default_config};
use deliberai_core::providers::OpenAiCompatAdapter;
use deliberai_core::{
    AdapterRegistry, DeliberationError, DeliberationStatus, DeliberationStore, ModelRegistry,
    OAuthSession, Provider, transcript,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "deliberai",
    version,
    about = "Multi-round deliberation between LLMs",
    long_about = "Sends the same prompt to several models, feeds selected answers back as shared context, and asks a judge model for a final verdict."
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to a TOML configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a deliberation
    Run(RunArgs),
    /// List known models
    Models {
        /// Only models of this provider (gemini, openrouter, perplexity, openai, local)
        #[arg(long)]
        provider: Option<String>,
        /// Only free models
        #[arg(long)]
        free: bool,
    },
    /// Show provider availability
    Providers,
    /// Log in through the browser (OAuth)
    Login,
}

#[derive(Args)]
struct RunArgs {
    /// The problem to deliberate
    #[arg(value_name = "PROMPT")]
    prompt: String,

    /// Participating model ids (specify once per model)
    #[arg(short, long, action = ArgAction::Append, value_name = "MODEL")]
    model: Vec<String>,

    /// Rounds to run before finishing (non-interactive mode)
    #[arg(short, long, default_value = "1", value_name = "ROUNDS")]
    rounds: u32,

    /// Judge model id for the final synthesis
    #[arg(short, long, value_name = "MODEL")]
    judge: Option<String>,

    /// Finish with the full transcript instead of a synthesis
    #[arg(long)]
    full_transcript: bool,

    /// Write the Markdown export to this file
    #[arg(short, long, value_name = "FILE")]
    export: Option<PathBuf>,

    /// Curate responses and drive rounds from the keyboard
    #[arg(short, long)]
    interactive: bool,

    /// Require an OAuth login before any provider call
    #[arg(long)]
    oauth: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match cli.verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => default_config(),
    }
    .with_env_overrides();

    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Models { provider, free } => list_models(config, provider, free).await,
        Command::Providers => show_providers(config).await,
        Command::Login => {
            login(&OAuthSession::new()?).await?;
            println!("{}", "Login concluído.".green().bold());
            Ok(())
        }
    }
}

/// Builtin catalog plus whatever the local server reports.
async fn model_registry(config: &Config) -> ModelRegistry {
    let mut registry = ModelRegistry::builtin();
    let adapter = match OpenAiCompatAdapter::new(
        Provider::Local,
        &config.providers.local,
        config.deliberation.request_timeout(),
    ) {
        Ok(adapter) => adapter,
        Err(e) => {
            warn!("local adapter unavailable: {}", e);
            return registry;
        }
    };
    let discovered = adapter.list_models().await;
    debug!(count = discovered.len(), "local models discovered");
    for upstream in discovered {
        registry.register_local(&upstream);
    }
    registry
}

fn parse_provider(name: &str) -> Result<Provider> {
    Provider::ALL
        .into_iter()
        .find(|p| p.display_name().eq_ignore_ascii_case(name))
        .with_context(|| format!("Unknown provider: '{}'", name))
}

async fn list_models(config: Config, provider: Option<String>, free: bool) -> Result<()> {
    let registry = model_registry(&config).await;
    let provider = provider.as_deref().map(parse_provider).transpose()?;

    for info in registry.all() {
        if provider.is_some_and(|p| p != info.provider) || (free && !info.free) {
            continue;
        }
        println!(
            "{:<45} {} {}",
            info.id.bright_cyan(),
            info.name,
            format!("[{}]", info.provider).dimmed()
        );
    }
    Ok(())
}

async fn show_providers(config: Config) -> Result<()> {
    let adapters =
        AdapterRegistry::from_config(&config.providers, config.deliberation.request_timeout())?;
    let statuses = adapters.statuses().await;

    for provider in Provider::ALL {
        let Some(status) = statuses.get(&provider) else {
            continue;
        };
        if status.available {
            println!("{} {}", "✓".green(), provider);
        } else {
            println!(
                "{} {} {}",
                "✗".red(),
                provider,
                status.reason.as_deref().unwrap_or_default().dimmed()
            );
        }
    }
    Ok(())
}

async fn login(session: &OAuthSession) -> Result<()> {
    let listener = CallbackListener::bind().await?;
    let request = session.begin_login()?;
    println!("Abra no navegador para autenticar:");
    println!("  {}", request.url.bright_white());

    let callback = listener.wait_for_callback().await?;
    session.complete_login(&callback).await?;
    info!("session established");
    Ok(())
}

async fn run(config: Config, args: RunArgs) -> Result<()> {
    let models = if args.model.is_empty() {
        config.deliberation.default_models.clone()
    } else {
        args.model.clone()
    };
    if models.is_empty() {
        bail!("No models given. Use -m MODEL (see `deliberai models`).");
    }
    let judge = args
        .judge
        .clone()
        .or_else(|| config.deliberation.default_judge.clone());

    let registry = model_registry(&config).await;
    let adapters =
        AdapterRegistry::from_config(&config.providers, config.deliberation.request_timeout())?;
    let store = DeliberationStore::new(
        adapters,
        registry.clone(),
        config.prompts.participant_prompt.clone(),
    );
    store.subscribe(console::event_printer(registry));

    if args.oauth {
        let session = Arc::new(OAuthSession::new()?);
        login(&session).await?;
        store.set_session_gate(session);
    }

    console::banner("DeliberAI");
    println!();
    println!("{} {}", "Problema:".bold(), args.prompt.bright_white());

    store.start_deliberation(&args.prompt, &models).await?;
    console::render_round(&store.snapshot());

    if args.interactive {
        interactive(&store, judge, args.export).await
    } else {
        batch(&store, &args, judge).await
    }
}

/// Run `--rounds` rounds feeding every valid response forward, then finish.
async fn batch(store: &DeliberationStore, args: &RunArgs, judge: Option<String>) -> Result<()> {
    for _ in 1..args.rounds {
        store.select_all_responses();
        store.start_next_round().await?;
        console::render_round(&store.snapshot());
    }

    finish(store, judge.as_deref(), args.full_transcript, args.export.as_deref()).await
}

/// Judge, transcript and export. A judge failure is reported after the
/// transcript and the export have been written.
async fn finish(
    store: &DeliberationStore,
    judge: Option<&str>,
    full_transcript: bool,
    export_path: Option<&Path>,
) -> Result<()> {
    if judge.is_some() || full_transcript {
        store.select_all_responses();
    }

    let mut verdict = Ok(());
    if let Some(judge) = judge {
        match store.request_judge_synthesis(judge).await {
            Ok(synthesis) => console::render_result("Síntese Final", &synthesis),
            Err(e) => {
                warn!(judge, error = %e, "judge synthesis failed");
                println!("{} {}", "Juiz falhou:".red().bold(), e);
                verdict = Err(e);
            }
        }
    }
    if full_transcript {
        let document = store.end_with_full_transcript()?;
        console::render_result("Transcrição Integral", &document);
    }

    if let Some(path) = export_path {
        export(store, Some(path.to_path_buf()))?;
    }
    verdict.context("Judge synthesis failed")
}

fn export(store: &DeliberationStore, path: Option<PathBuf>) -> Result<()> {
    let snapshot = store.snapshot();
    let path =
        path.unwrap_or_else(|| PathBuf::from(transcript::export_file_name(&snapshot.responses)));
    std::fs::write(&path, store.export_markdown(true))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("{} {}", "Exportado para".green(), path.display());
    Ok(())
}

const HELP: &str = "\
  s <n>      alternar seleção da resposta n
  a          selecionar todas
  c          limpar seleção
  n          próxima rodada
  r <model>  remover modelo das próximas rodadas
  + <model>  adicionar modelo às próximas rodadas
  j [model]  síntese pelo juiz
  f          transcrição integral
  e [file]   exportar Markdown
  x          nova deliberação (mesmo problema e modelos)
  q          sair";

async fn interactive(
    store: &DeliberationStore,
    default_judge: Option<String>,
    export_path: Option<PathBuf>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let snapshot = store.snapshot();
    let (prompt, initial_models) = (snapshot.prompt.clone(), snapshot.models.clone());

    loop {
        let snapshot = store.snapshot();
        console::render_selection(&snapshot);
        println!(
            "{} {}  {}",
            format!("Rodada {}", snapshot.round).bold(),
            format!("({})", console::status_label(snapshot.status)).dimmed(),
            "? para ajuda".dimmed()
        );
        print!("> ");
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        let (command, arg) = line
            .split_once(char::is_whitespace)
            .map(|(c, a)| (c, a.trim()))
            .unwrap_or((line, ""));

        let outcome: Result<(), DeliberationError> = match command {
            "" => Ok(()),
            "?" | "h" => {
                println!("{}", HELP);
                Ok(())
            }
            "s" => {
                let numbered = console::numbered(&snapshot);
                match arg.parse::<usize>().ok().and_then(|n| numbered.get(n.wrapping_sub(1))) {
                    Some(response) => {
                        store.toggle_response_selection(&response.id);
                    }
                    None => println!("{}", "Número de resposta inválido.".yellow()),
                }
                Ok(())
            }
            "a" => {
                store.select_all_responses();
                Ok(())
            }
            "c" => {
                store.clear_response_selection();
                Ok(())
            }
            "n" => store.start_next_round().await.map(|_| console::render_round(&store.snapshot())),
            "r" => {
                if !store.remove_model(arg) {
                    println!("{}", "Modelo não está ativo.".yellow());
                }
                Ok(())
            }
            "+" => {
                if !store.add_model(arg) {
                    println!("{}", "Modelo já está ativo.".yellow());
                }
                Ok(())
            }
            "j" => {
                let judge = Some(arg)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .or_else(|| default_judge.clone());
                match judge {
                    Some(judge) => store
                        .request_judge_synthesis(&judge)
                        .await
                        .map(|text| console::render_result("Síntese Final", &text)),
                    None => {
                        println!("{}", "Informe o modelo juiz: j <model>".yellow());
                        Ok(())
                    }
                }
            }
            "f" => store
                .end_with_full_transcript()
                .map(|text| console::render_result("Transcrição Integral", &text)),
            "e" => {
                let path = Some(arg)
                    .filter(|a| !a.is_empty())
                    .map(PathBuf::from)
                    .or_else(|| export_path.clone());
                if let Err(e) = export(store, path) {
                    println!("{} {:#}", "Error:".red().bold(), e);
                }
                Ok(())
            }
            "x" => store
                .start_deliberation(&prompt, &initial_models)
                .await
                .map(|_| console::render_round(&store.snapshot())),
            "q" => break,
            other => {
                println!("{} '{}'", "Comando desconhecido:".yellow(), other);
                Ok(())
            }
        };

        if let Err(e) = outcome {
            println!("{} {}", "Error:".red().bold(), e);
        }
        if store.status() == DeliberationStatus::Completed {
            debug!("deliberation completed");
        }
    }

    if let Some(path) = export_path {
        export(store, Some(path))?;
    }
    Ok(())
}
