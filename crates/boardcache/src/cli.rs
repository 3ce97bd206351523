//! Exposes the command line application.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use boardcache_service::config::Config;
use boardcache_service::metrics;
use clap::{Parser, Subcommand};

use crate::commands;
use crate::logging;

/// Boardcache commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch media or JSON through the in-memory caches.
    Fetch(commands::FetchArgs),

    /// Merge a list of posts into the snapshot of a thread.
    MergeThread(commands::MergeThreadArgs),

    /// Clean up the on-disk response cache.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "boardcache", version, about)]
pub struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: no runtime has been started yet, so this is the only thread.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure statsd")?;
    } else {
        tracing::debug!("No statsd configured, metrics are disabled");
    }

    match cli.command {
        Command::Fetch(args) => commands::fetch(config, args).context("failed to fetch")?,
        Command::MergeThread(args) => {
            commands::merge_thread(config, args).context("failed to merge thread")?
        }
        Command::Cleanup { dry_run } => {
            let stats = boardcache_service::caching::cleanup(config, dry_run)
                .context("failed to clean up caches")?;
            println!("{}", serde_json::to_string_pretty(&cleanup_report(&stats))?);
        }
    }

    Ok(())
}

fn cleanup_report(
    stats: &boardcache_service::caching::CleanupStats,
) -> BTreeMap<&'static str, u64> {
    BTreeMap::from([
        ("removed_dirs", stats.removed_dirs as u64),
        ("removed_files", stats.removed_files as u64),
        ("removed_bytes", stats.removed_bytes),
        ("retained_dirs", stats.retained_dirs as u64),
        ("retained_files", stats.retained_files as u64),
        ("retained_bytes", stats.retained_bytes),
    ])
}
