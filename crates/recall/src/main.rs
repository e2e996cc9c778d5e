//! Recall - caching and write batching in front of a memory store

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use recall::MemoryService;
use recall::cache::InMemoryKv;
use recall::config::Config;
use recall::error::{RecallError, Result};
use recall::memory::NewMemory;
use recall::storage::InMemoryBackend;

/// Recall - tiered caching and write batching for conversational memory
#[derive(Parser)]
#[command(name = "recall")]
#[command(about = "Tiered caching and write batching for conversational memory")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the effective configuration as TOML
    Config,

    /// Store memories from a JSON-lines file and print each owner's summary
    Replay {
        /// File with one memory object per line
        path: PathBuf,

        /// Write each memory immediately instead of through the batch buffer
        #[arg(long)]
        no_batch: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        Command::Config => print_config(&config),
        Command::Replay { path, no_batch } => replay(config, &path, !no_batch).await,
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,recall=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    if let Some(path) = config_path {
        tracing::info!("Loading config from: {}", path.display());
        return Config::from_file(&path);
    }

    for path in Config::default_paths() {
        if path.exists() {
            tracing::info!("Loading config from: {}", path.display());
            return Config::from_file(&path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(Config::default())
}

fn print_config(config: &Config) -> Result<()> {
    let rendered = toml::to_string_pretty(config)
        .map_err(|e| RecallError::Config(format!("Failed to render config: {e}")))?;
    print!("{rendered}");
    Ok(())
}

fn read_memories(path: &Path) -> Result<Vec<NewMemory>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        RecallError::General(format!("Failed to read {}: {}", path.display(), e))
    })?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str::<NewMemory>(line).map_err(|e| {
                RecallError::Serialization(format!("{}:{}: {}", path.display(), n + 1, e))
            })
        })
        .collect()
}

async fn replay(config: Config, path: &Path, use_batch: bool) -> Result<()> {
    let memories = read_memories(path)?;
    tracing::info!(
        count = memories.len(),
        use_batch,
        "Replaying memories from {}",
        path.display()
    );

    let owners: BTreeSet<String> = memories.iter().map(|m| m.owner_id.clone()).collect();
    let service = MemoryService::new(
        config,
        Arc::new(InMemoryBackend::new()),
        Arc::new(InMemoryKv::new()),
    )?;

    for memory in memories {
        service.store(memory, use_batch).await?;
    }
    service.flush().await?;

    for owner in &owners {
        let summary = service.get_summary(owner).await?;
        println!(
            "{}",
            serde_json::json!({ "owner_id": owner, "summary": summary })
        );
    }

    let buffer = service.buffer_stats();
    tracing::info!(
        flushes = buffer.flushes,
        flushed_items = buffer.flushed_items,
        failed_flushes = buffer.failed_flushes,
        dropped = buffer.dropped,
        "Replay complete"
    );

    service.shutdown().await
}
