//! Gluon Model Store - command line entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gluon_model_store::{CacheStatus, ModelCache, StoreConfig};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gluon-models")]
#[command(about = "Fetch, verify and purge pretrained Gluon model weights", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the model cache directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Override the repository base URL
    #[arg(long)]
    repo_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve models to verified local files, downloading as needed
    Fetch {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Check cached files against the registry without downloading
    Verify {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// List registered models and their cache state
    List {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Delete all cached parameter files
    Purge,
}

#[derive(Serialize)]
struct ListEntry {
    model: String,
    short_hash: String,
    cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_bytes: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    // Load configuration
    let mut config = StoreConfig::load(cli.config).context("Failed to load configuration")?;

    // CLI overrides
    if let Some(root) = cli.root {
        config.root_dir = root;
    }
    if let Some(repo_url) = cli.repo_url {
        config.repo_url = repo_url;
    }

    tracing::debug!(
        root_dir = ?config.root_dir,
        repo_url = %config.repo_url,
        file_lock = config.file_lock,
        "Configuration loaded"
    );

    let cache = ModelCache::from_config(&config).context("Invalid configuration")?;

    match cli.command {
        Command::Fetch { names } => {
            for name in names {
                let path = cache
                    .resolve(&name)
                    .await
                    .with_context(|| format!("Failed to fetch model {}", name))?;
                println!("{}", path.display());
            }
        }
        Command::Verify { names } => {
            let mut failed = 0;
            for name in &names {
                let status = cache.status(name).await?;
                if status != CacheStatus::Valid {
                    failed += 1;
                }
                println!("{}\t{}", name, status);
            }
            if failed > 0 {
                anyhow::bail!("{} of {} models are not cached and valid", failed, names.len());
            }
        }
        Command::List { json } => {
            let cached = cache.cached_models().await?;
            let entries: Vec<ListEntry> = cache
                .registry()
                .names()
                .into_iter()
                .map(|name| {
                    let file = cached.iter().find(|m| m.model.as_deref() == Some(name));
                    ListEntry {
                        model: name.to_string(),
                        short_hash: cache.short_hash(name).unwrap_or_default(),
                        cached: file.is_some(),
                        size_bytes: file.map(|m| m.size_bytes),
                    }
                })
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    let size = entry
                        .size_bytes
                        .map(|s| format!("{:.1} MiB", s as f64 / 1024.0 / 1024.0))
                        .unwrap_or_else(|| "-".to_string());
                    println!("{:<20} {}  {:>12}", entry.model, entry.short_hash, size);
                }
            }
        }
        Command::Purge => {
            let removed = cache.purge().await?;
            println!("Removed {} cached model file(s)", removed);
        }
    }

    Ok(())
}
