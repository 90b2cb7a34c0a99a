//! Cache management command

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use console::style;

use gantry_cache::{Cache, FsCache, TracingRecorder};
use gantry_core::config::load_config_or_default;

use crate::cli::context::{cache_dir, detect_workspace};
use crate::cli::output;
use crate::cli::{Cli, OutputFormat};
use crate::exit_codes;

/// Task cache management
#[derive(Debug, Args)]
pub struct CacheCommand {
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Remove old cache entries
    Prune(CachePruneCommand),
    /// Show cache statistics
    Status(CacheStatusCommand),
    /// Clear all cached entries
    Clean(CacheCleanCommand),
}

/// Prune old cache entries
#[derive(Debug, Args)]
pub struct CachePruneCommand {
    /// Maximum age in days
    #[arg(long, default_value = "7")]
    pub max_age_days: u64,
}

/// Show cache statistics
#[derive(Debug, Args)]
pub struct CacheStatusCommand;

/// Clear all cached entries
#[derive(Debug, Args)]
pub struct CacheCleanCommand {
    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl CacheCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        match &self.action {
            CacheAction::Prune(cmd) => cmd.execute(cli),
            CacheAction::Status(cmd) => cmd.execute(cli),
            CacheAction::Clean(cmd) => cmd.execute(cli),
        }
        .map(|()| exit_codes::SUCCESS)
    }
}

/// The configured local cache directory for the current repository
fn local_cache_dir() -> anyhow::Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    let root = detect_workspace(&cwd)?
        .map(|ws| ws.root)
        .unwrap_or(cwd);
    let (config, _) = load_config_or_default(&root)?;
    Ok(cache_dir(&root, &config))
}

fn open_local_cache() -> anyhow::Result<FsCache> {
    Ok(FsCache::new(local_cache_dir()?, Arc::new(TracingRecorder))?)
}

impl CachePruneCommand {
    fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let cache = open_local_cache()?;
        let max_age = Duration::from_secs(self.max_age_days * 24 * 60 * 60);

        if !cli.quiet && cli.format == OutputFormat::Text {
            output::info(&format!(
                "Pruning cache entries older than {} days...",
                self.max_age_days
            ));
        }

        let stats = cache.prune(max_age)?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "total": stats.total,
                "removed": stats.removed,
                "kept": stats.kept,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!(
                "  {} Removed {} of {} entries ({} kept)",
                style("✓").green(),
                stats.removed,
                stats.total,
                stats.kept
            );
        }

        Ok(())
    }
}

impl CacheStatusCommand {
    fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let cache = open_local_cache()?;
        let stats = cache.status()?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "entries": stats.entries,
                "total_size": stats.total_size,
                "total_size_formatted": stats.formatted_size(),
                "cache_dir": cache.cache_dir().display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!("{}", output::header("Task Cache Status"));
            println!();
            println!(
                "{}",
                output::key_value(
                    "Location",
                    &output::path_style()
                        .apply_to(cache.cache_dir().display())
                        .to_string()
                )
            );
            println!("{}", output::key_value("Entries", &stats.entries.to_string()));
            println!(
                "{}",
                output::key_value("Size", &style(stats.formatted_size()).yellow().to_string())
            );
        }

        Ok(())
    }
}

impl CacheCleanCommand {
    fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let cache_dir = local_cache_dir()?;

        if !cache_dir.exists() {
            if !cli.quiet {
                output::success("Cache directory does not exist.");
            }
            return Ok(());
        }

        if !self.yes {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!(
                    "Remove all cached entries at {}?",
                    cache_dir.display()
                ))
                .default(false)
                .interact()?;

            if !confirmed {
                println!("{}", style("Aborted.").yellow());
                return Ok(());
            }
        }

        let cache = FsCache::new(&cache_dir, Arc::new(TracingRecorder))?;
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(async {
            cache.clean_all().await?;
            cache.shutdown().await;
            anyhow::Ok(())
        })?;

        if !cli.quiet {
            output::success(&format!(
                "Cache cleared at {}",
                output::path_style().apply_to(cache_dir.display())
            ));
        }

        Ok(())
    }
}
