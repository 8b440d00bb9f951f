//! sharedlogd - shared log node runner
//!
//! The production roles (sequencer, engine, storage) are embedded behind a
//! transport by the enclosing platform; this binary offers a config check
//! and a standalone single-process playground.

use std::path::PathBuf;
use std::process::ExitCode;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use sharedlog::{EmbeddedSharedLog, SharedLogConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sharedlogd", version, about = "Shared log core runner")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the primary's cut-marking tick period, in microseconds
    #[arg(long, global = true)]
    local_cut_interval_us: Option<u64>,

    /// Override the storage live-entry cap
    #[arg(long, global = true)]
    storage_max_live_entries: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and exit
    Check,
    /// Run a single-process playground instance and exercise one
    /// append/read round
    Standalone {
        /// Number of demo records to append
        #[arg(long, default_value_t = 3)]
        records: u32,
    },
}

/// Config file first, then command-line overrides, then validation
fn load_config(cli: &Cli) -> sharedlog::Result<SharedLogConfig> {
    let mut config = match &cli.config {
        Some(path) => SharedLogConfig::from_file(path)?,
        None => SharedLogConfig::default(),
    };
    if let Some(interval) = cli.local_cut_interval_us {
        config.local_cut_interval_us = interval;
    }
    if let Some(cap) = cli.storage_max_live_entries {
        config.storage_max_live_entries = cap;
    }
    config.validate()?;
    Ok(config)
}

fn run_standalone(config: &SharedLogConfig, records: u32) -> sharedlog::Result<()> {
    let log = EmbeddedSharedLog::with_config(config)?;
    for i in 0..records {
        let tag = u64::from(i % 4 + 1);
        let local_id = log.append(tag, Bytes::from(format!("record-{i}")))?;
        info!(tag, local_id = format_args!("{local_id:#018x}"), "appended");
    }
    log.tick()?;
    for seqnum in 0..u64::from(records) {
        let entry = log.read_at(seqnum)?;
        info!(
            seqnum = format_args!("{seqnum:#x}"),
            tag = entry.metadata.tag,
            size = entry.data.len(),
            "read back"
        );
    }
    let flushed = log.flush()?;
    info!(flushed, "records persisted to the backing store");
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "configuration rejected");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Check => {
            info!("configuration OK");
            Ok(())
        }
        Command::Standalone { records } => run_standalone(&config, records),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "fatal");
            ExitCode::FAILURE
        }
    }
}
