mod command;
mod noninteractive;
mod output;
mod repl;


use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::core::config::AppConfig;
use crate::core::model::ModelId;
use crate::orchestrator::{Orchestrator, TerminalConsentProbe};
use crate::storage::{Database, KvStore, MemoryKv};

#[derive(Parser, Debug)]
#[command(name = "chatline", version, about = "Multi-model AI chat for the terminal")]
struct Cli {
    /// Non-interactive mode: provide a prompt directly
    #[arg(short, long)]
    prompt: Option<String>,

    /// Model to use (overrides config)
    #[arg(short, long)]
    model: Option<String>,

    /// Enable speed mode
    #[arg(long, conflicts_with = "thinking")]
    speed: bool,

    /// Enable thinking mode
    #[arg(long)]
    thinking: bool,

    /// Resume a saved chat by ID
    #[arg(long)]
    chat: Option<String>,

    /// Working directory
    #[arg(short = 'c', long = "cwd")]
    working_dir: Option<PathBuf>,

    /// Output format for non-interactive mode
    #[arg(short = 'f', long, default_value = "text")]
    output_format: OutputFormat,

    /// Suppress progress notices
    #[arg(short, long)]
    quiet: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Keep everything in memory; nothing is written to disk
    #[arg(long)]
    ephemeral: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub struct App {
    pub orchestrator: Orchestrator,
    pub config: AppConfig,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    let config = crate::core::config::load_config(cli.working_dir.clone())
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let filter = if cli.debug || config.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if !config.has_api_key() {
        anyhow::bail!(
            "No API key found. Set CHATLINE_API_KEY or OPENAI_API_KEY, or add api_key to chatline.json."
        );
    }

    let app = build_app(config, cli.ephemeral).await?;
    let orch = &app.orchestrator;

    if let Some(id) = &cli.chat {
        orch.load_chat(id).await?;
    }
    if let Some(model) = cli.model {
        orch.set_model(&ModelId(model)).await?;
    }
    if cli.speed && !orch.mode().await.is_speed() {
        orch.set_speed_mode(true).await?;
    }
    if cli.thinking && !orch.mode().await.is_thinking() {
        orch.set_thinking_mode(true).await?;
    }

    let result = match cli.prompt {
        Some(prompt) => noninteractive::run(&app, prompt, cli.output_format, cli.quiet).await,
        None => repl::run(&app).await,
    };

    app.orchestrator.shutdown().await;
    result
}

async fn build_app(config: AppConfig, ephemeral: bool) -> Result<App> {
    let kv: Arc<dyn KvStore> = if ephemeral {
        Arc::new(MemoryKv::with_quota(config.storage.quota_bytes))
    } else {
        let db = Database::open(&config)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        db.run_migrations()
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        Arc::new(db.kv())
    };

    let provider = crate::providers::create_provider(&config).map_err(|e| anyhow::anyhow!("{e}"))?;
    let orchestrator = Orchestrator::load(
        provider,
        kv,
        config.clone(),
        Arc::new(TerminalConsentProbe),
    )
    .await;

    Ok(App {
        orchestrator,
        config,
    })
}
