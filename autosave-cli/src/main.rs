//! autosave - scheduled, integrity-checked backups of session state.

mod cmd;
mod config;
mod shutdown;

use anyhow::Result;
use autosave_core::logger;
use clap::{Parser, Subcommand};
use config::AppConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Backup directory (overrides config and environment)
    #[arg(long, value_name = "DIR", global = true)]
    backup_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the state file and back it up on schedule
    Watch {
        /// State file to protect (overrides config)
        #[arg(long, value_name = "FILE")]
        state_file: Option<PathBuf>,
    },
    /// List stored snapshots
    List { dir: Option<PathBuf> },
    /// Check every stored snapshot against its checksum
    Verify { dir: Option<PathBuf> },
    /// Restore a snapshot into a state file
    Restore {
        dir: Option<PathBuf>,
        /// Manifest path of the snapshot (default: newest session)
        #[arg(long)]
        entry: Option<String>,
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
        /// Try older snapshots when the chosen one is corrupt
        #[arg(long)]
        follow_fallback: bool,
    },
    /// Show what would be offered for restore on start-up
    Candidate { dir: Option<PathBuf> },
    /// Write one snapshot out through the manual-export backend
    Export {
        dir: Option<PathBuf>,
        #[arg(long)]
        entry: String,
        #[arg(long, value_name = "DIR")]
        to: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.backup_dir {
        config.paths.backup_dir = dir;
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    logger::init(log_level)?;
    tracing::debug!("autosave v{}", env!("CARGO_PKG_VERSION"));

    let backup_dir = |dir: Option<PathBuf>| dir.unwrap_or_else(|| config.paths.backup_dir.clone());

    match args.command {
        Command::Watch { state_file } => {
            let mut config = config.clone();
            if let Some(state_file) = state_file {
                config.paths.state_file = state_file;
            }
            cmd::watch::run(config).await
        }
        Command::List { dir } => cmd::list::run(&backup_dir(dir)).await,
        Command::Verify { dir } => cmd::verify::run(&backup_dir(dir)).await,
        Command::Restore {
            dir,
            entry,
            out,
            follow_fallback,
        } => cmd::restore::run(&backup_dir(dir), entry.as_deref(), &out, follow_fallback).await,
        Command::Candidate { dir } => {
            cmd::candidate::run(
                &backup_dir(dir),
                &config.paths.state_file,
                &config.paths.unload_marker,
            )
            .await
        }
        Command::Export { dir, entry, to } => cmd::export::run(&backup_dir(dir), &entry, &to).await,
    }
}
