//! Reverie CLI - operate a tiered conversational memory
//!
//! Usage:
//!   reverie ask "question" -u alice -s s1    Answer a query, streaming the reply
//!   reverie history -u alice -s s1           Show recent exchanges
//!   reverie actions -u alice -s s1 -l 0      Show persisted sub-actions of a level
//!   reverie consolidate -u alice -s s1       Run pending consolidations now
//!   reverie imagine                          Run one imagination sweep
//!   reverie daemon                           Sweep imaginations until Ctrl-C

use clap::{Args, Parser, Subcommand};
use colored::*;
use reverie::{
    MemoryStore, QueryOutcome, Reverie, ReverieConfig, Services, SessionKey,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "reverie")]
#[command(about = "Reverie - Tiered memory and recursive reasoning for conversational agents")]
#[command(version)]
struct Cli {
    /// Path to data directory
    #[arg(short, long, env = "REVERIE_DATA_DIR", default_value = "./reverie_data")]
    data_dir: PathBuf,

    /// JSON configuration file; missing fields keep their defaults
    #[arg(short, long, env = "REVERIE_CONFIG")]
    config: Option<PathBuf>,

    /// API key of the OpenAI-compatible completion service
    #[arg(long, env = "REVERIE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Base URL of the completion service
    #[arg(long, env = "REVERIE_BASE_URL")]
    base_url: Option<String>,

    /// Completion model
    #[arg(long, env = "REVERIE_MODEL")]
    model: Option<String>,

    /// API key of the web search service; research is disabled without it
    #[arg(long, env = "REVERIE_SEARCH_API_KEY", hide_env_values = true)]
    search_api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SessionArgs {
    /// User id
    #[arg(short, long, env = "REVERIE_USER", default_value = "default")]
    user: String,

    /// Session id
    #[arg(short, long, env = "REVERIE_SESSION", default_value = "default")]
    session: String,
}

impl SessionArgs {
    fn key(&self) -> SessionKey {
        SessionKey::new(&self.user, &self.session)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a query
    Ask {
        /// The question
        query: String,

        #[command(flatten)]
        session: SessionArgs,

        /// Print the reply and diagnostics as JSON instead of streaming
        #[arg(long)]
        json: bool,
    },

    /// Show recent exchanges, newest last
    History {
        #[command(flatten)]
        session: SessionArgs,

        /// Number of exchanges
        #[arg(short, long, default_value = "10")]
        limit: i64,

        /// Skip this many of the newest exchanges
        #[arg(short, long, default_value = "0")]
        offset: i64,
    },

    /// Show persisted sub-actions of a recursion level
    Actions {
        #[command(flatten)]
        session: SessionArgs,

        /// Recursion level
        #[arg(short, long, default_value = "0")]
        lvl: u32,

        /// Number of actions
        #[arg(short = 'n', long, default_value = "10")]
        limit: i64,
    },

    /// Run every consolidation that is currently computable
    Consolidate {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Run one imagination sweep over every due session
    Imagine,

    /// Sweep due imaginations on an interval until interrupted
    Daemon {
        /// Seconds between sweeps (defaults to the configured poll interval)
        #[arg(short, long)]
        poll_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,reverie=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Ask {
            query,
            session,
            json,
        } => cmd_ask(&cli, config, &session.key(), query, *json).await,
        Commands::History {
            session,
            limit,
            offset,
        } => cmd_history(&cli.data_dir, config, &session.key(), *limit, *offset).await,
        Commands::Actions {
            session,
            lvl,
            limit,
        } => cmd_actions(&cli.data_dir, config, &session.key(), *lvl, *limit).await,
        Commands::Consolidate { session } => cmd_consolidate(&cli, config, &session.key()).await,
        Commands::Imagine => cmd_imagine(&cli, config).await,
        Commands::Daemon { poll_secs } => cmd_daemon(&cli, config, *poll_secs).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ReverieConfig> {
    let mut config = match &cli.config {
        Some(path) => ReverieConfig::from_json_file(path)?,
        None => ReverieConfig::default(),
    };
    if let Some(base_url) = &cli.base_url {
        config.completion.base_url = base_url.clone();
    }
    if let Some(model) = &cli.model {
        config.completion.model = model.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn open(cli: &Cli, config: ReverieConfig) -> anyhow::Result<Reverie> {
    let Some(api_key) = cli.api_key.as_deref() else {
        anyhow::bail!("an API key is required for this command (set REVERIE_API_KEY or pass --api-key)");
    };
    let services = Services::remote(&config, api_key, cli.search_api_key.as_deref())?;
    Ok(Reverie::open(&cli.data_dir, config, services).await?)
}

async fn cmd_ask(cli: &Cli, config: ReverieConfig, key: &SessionKey, query: &str, json: bool) -> anyhow::Result<()> {
    let reverie = open(cli, config).await?;

    let outcome = if json {
        reverie.ask(key, query).await?
    } else {
        let printed = Mutex::new(String::new());
        let on_partial = |partial: &str| {
            if let Ok(mut printed) = printed.lock() {
                print_delta(&mut printed, partial);
            }
        };
        let outcome = reverie.agent().query_streaming(key, query, &on_partial).await?;
        if let Ok(mut printed) = printed.lock() {
            print_delta(&mut printed, &outcome.reply);
        }
        println!();
        outcome
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_diagnostics(&outcome);
    }

    // Consolidation runs to completion; delayed introspection does not outlive the process
    reverie.agent().tasks().wait_idle().await;
    let cancelled = reverie.agent().tasks().abort_delayed().await;
    if cancelled > 0 {
        tracing::debug!(cancelled, "cancelled pending introspection");
    }
    Ok(())
}

/// Print what `text` adds to what is already on screen
fn print_delta(printed: &mut String, text: &str) {
    let mut stdout = std::io::stdout();
    if let Some(rest) = text.strip_prefix(printed.as_str()) {
        let _ = write!(stdout, "{rest}");
    } else {
        let _ = write!(stdout, "\n{text}");
    }
    let _ = stdout.flush();
    *printed = text.to_string();
}

fn print_diagnostics(outcome: &QueryOutcome) {
    let diag = &outcome.diagnostics;
    println!();
    println!(
        "{} {} iteration(s), {} action(s), {} tokens",
        "~".dimmed(),
        diag.iterations,
        diag.actions.len(),
        diag.usage.total()
    );
    for action in &diag.actions {
        let status = if action.result.is_some() {
            "*".green()
        } else {
            "x".red()
        };
        println!(
            "  {} {} {}",
            status,
            action.kind.to_string().cyan(),
            action.query.as_deref().or(action.note.as_deref()).unwrap_or_default()
        );
    }
    for warning in &diag.warnings {
        println!("  {} {}", "!".yellow(), warning.dimmed());
    }
}

async fn open_store(data_dir: &Path, config: &ReverieConfig) -> anyhow::Result<std::sync::Arc<MemoryStore>> {
    std::fs::create_dir_all(data_dir)?;
    Ok(MemoryStore::connect(data_dir.join("reverie.db"), config.memory.clone()).await?)
}

async fn cmd_history(data_dir: &Path, config: ReverieConfig, key: &SessionKey, limit: i64, offset: i64) -> anyhow::Result<()> {
    let store = open_store(data_dir, &config).await?;
    let history = store.get_history(key, offset, limit).await?;

    if history.is_empty() {
        println!("{}", "No exchanges found".yellow());
        return Ok(());
    }

    println!("{}", format!("Showing {} exchange(s) for {key}:", history.len()).bold());
    println!();
    for element in &history {
        println!(
            "{} {}",
            format!("#{}", element.index).dimmed(),
            element.timestamp.format("%Y-%m-%d %H:%M").to_string().dimmed()
        );
        println!("  {} {}", "user:".cyan(), element.payload.query);
        println!("  {} {}", "assistant:".green(), element.payload.reply);
    }
    Ok(())
}

async fn cmd_actions(data_dir: &Path, config: ReverieConfig, key: &SessionKey, lvl: u32, limit: i64) -> anyhow::Result<()> {
    let store = open_store(data_dir, &config).await?;
    let actions = store.get_actions(key, lvl, limit).await?;

    if actions.is_empty() {
        println!("{}", format!("No actions at level {lvl}").yellow());
        return Ok(());
    }

    for action in &actions {
        let payload = &action.payload;
        println!(
            "{} {} {}",
            format!("#{}", action.index).dimmed(),
            payload.kind.to_string().cyan(),
            payload.query.as_deref().or(payload.note.as_deref()).unwrap_or_default()
        );
        println!("  {}", payload.result.chars().take(200).collect::<String>());
    }
    Ok(())
}

async fn cmd_consolidate(cli: &Cli, config: ReverieConfig, key: &SessionKey) -> anyhow::Result<()> {
    let reverie = open(cli, config).await?;
    let written = reverie.agent().consolidation().run(key).await?;

    if written.is_empty() {
        println!("{}", "Nothing to consolidate".yellow());
        return Ok(());
    }
    println!("{}", format!("Appended {} consolidation(s):", written.len()).bold().green());
    for stamp in &written {
        println!("  level {} #{}", stamp.lvl, stamp.index);
    }
    Ok(())
}

async fn cmd_imagine(cli: &Cli, config: ReverieConfig) -> anyhow::Result<()> {
    let reverie = open(cli, config).await?;
    let report = reverie.imagination().run_due(chrono::Utc::now()).await?;

    println!(
        "{} due, {} processed, {} skipped, {} failed",
        report.due,
        report.processed.to_string().green(),
        report.skipped.to_string().yellow(),
        report.failed.to_string().red()
    );
    Ok(())
}

async fn cmd_daemon(cli: &Cli, config: ReverieConfig, poll_secs: Option<u64>) -> anyhow::Result<()> {
    let poll = Duration::from_secs(poll_secs.unwrap_or(config.imagination.poll_interval_secs).max(1));
    let reverie = open(cli, config).await?;

    println!("{}", format!("Sweeping imaginations every {}s, Ctrl-C to stop", poll.as_secs()).bold());
    reverie
        .run_imagination_daemon(poll, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
