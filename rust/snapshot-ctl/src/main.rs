//! Checkpoint Snapshot Control Tool
//!
//! Inspects checkpoint records held by a metadata authority and the layout
//! of checkpoint files on disk.
//!
//! # Usage
//!
//! ```bash
//! # Show the state of one checkpoint
//! snapshot-ctl status /ckpt/global_step100/mp_rank_00_model_states.pt
//!
//! # List every cached checkpoint
//! snapshot-ctl list --state cached
//!
//! # Summarize a durable checkpoint file
//! snapshot-ctl inspect /ckpt/global_step100/mp_rank_00_model_states.pt
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use snapshot_core::checkpoint::{inspect, CheckpointSummary, DurableReader};
use snapshot_core::{
    CheckpointState, EngineConfig, EngineError, HttpAuthority, LocalStorage, MetadataAuthority,
    StateFilter,
};

/// Checkpoint Snapshot Control Tool
#[derive(Parser, Debug)]
#[command(name = "snapshot-ctl")]
#[command(about = "Inspect checkpoint snapshots and their authority records")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Metadata authority base URL (overrides the configuration)
    #[arg(long)]
    authority_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the authority's record for a checkpoint
    Status {
        /// Checkpoint path as it was saved
        path: PathBuf,
    },
    /// List checkpoint records
    List {
        /// Only show records in this state (pending, cached, backed_up, ...)
        #[arg(long)]
        state: Option<String>,

        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Summarize the layout of a checkpoint file
    Inspect {
        /// Path to a durable checkpoint file
        file: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    }
    .with_env_overrides();
    if let Some(url) = &args.authority_url {
        config.authority.url = url.clone();
    }
    config.validate()?;

    match args.command {
        Command::Status { path } => {
            let authority = HttpAuthority::new(&config.authority);
            tracing::debug!("Querying {} for {}", authority.base_url(), path.display());
            match authority.query(&path) {
                Ok(status) => {
                    println!("path:   {}", path.display());
                    println!("state:  {}", status.state);
                    println!("region: {}", status.region);
                }
                Err(e) if e.is_authority_rejection() => {
                    println!("path:   {}", path.display());
                    println!("state:  no live region ({e})");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::List { state, json } => {
            let filter = parse_filter(state.as_deref())?;
            let authority = HttpAuthority::new(&config.authority);
            let records = authority.list(filter)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                println!("{:<12} {:>10} {:>14}  PATH", "STATE", "ITERATION", "SIZE");
                for record in &records {
                    println!(
                        "{:<12} {:>10} {:>14}  {}",
                        record.state.name(),
                        record.iteration,
                        record.size,
                        record.path.display()
                    );
                }
                println!("{} record(s)", records.len());
            }
        }
        Command::Inspect { file } => {
            let reader = DurableReader::new(Arc::new(LocalStorage::new(&config.storage)));
            let bytes = reader
                .read(&file)?
                .ok_or_else(|| EngineError::unavailable(&file))?;
            let modified = reader.stat(&file)?.and_then(|info| info.modified);
            let summary = inspect(bytes)?;
            print_summary(&file, modified, &summary);
        }
    }

    Ok(())
}

fn parse_filter(state: Option<&str>) -> Result<StateFilter, EngineError> {
    match state {
        None => Ok(StateFilter::Any),
        Some(name) if name.eq_ignore_ascii_case("any") => Ok(StateFilter::Any),
        Some(name) => CheckpointState::from_name(name)
            .map(StateFilter::Only)
            .ok_or_else(|| EngineError::config(format!("unknown checkpoint state '{name}'"))),
    }
}

fn print_summary(file: &Path, modified: Option<DateTime<Utc>>, summary: &CheckpointSummary) {
    let sys = &summary.sys_info;
    println!("file:          {}", file.display());
    if let Some(modified) = modified {
        println!("modified:      {}", modified.to_rfc3339());
    }
    println!("total size:    {} bytes", summary.total_size);
    println!("metadata:      {} bytes", summary.metadata_len);
    println!("data:          {} bytes", summary.data_bytes());
    println!(
        "producer:      protocol {}, {} endian, short/int/long {}/{}/{}",
        sys.protocol_version,
        if sys.little_endian { "little" } else { "big" },
        sys.type_sizes.short,
        sys.type_sizes.int,
        sys.type_sizes.long
    );
    println!("view records:  {}", summary.view_records);
    if !summary.type_definitions.is_empty() {
        println!("types:         {}", summary.type_definitions.join(", "));
    }
    if summary.trailing_bytes > 0 {
        tracing::warn!("{} trailing bytes after the last storage", summary.trailing_bytes);
    }

    println!();
    println!("{:>20} {:<8} {:<8} {:>12} {:>14} {:>6}", "KEY", "DTYPE", "DEVICE", "NUMEL", "OFFSET", "REFS");
    for storage in &summary.storages {
        println!(
            "{:>20} {:<8} {:<8} {:>12} {:>14} {:>6}",
            storage.key.0,
            storage.dtype.name(),
            storage.location.as_str(),
            storage.numel,
            storage.offset,
            storage.references
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter() {
        assert_eq!(parse_filter(None).unwrap(), StateFilter::Any);
        assert_eq!(parse_filter(Some("ANY")).unwrap(), StateFilter::Any);
        assert_eq!(
            parse_filter(Some("persistent")).unwrap(),
            StateFilter::Only(CheckpointState::Persistent)
        );
        assert!(parse_filter(Some("bogus")).is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["snapshot-ctl", "list", "--state", "cached"]).unwrap();
        assert!(matches!(args.command, Command::List { state: Some(_), json: false }));

        let args = Args::try_parse_from([
            "snapshot-ctl",
            "--authority-url",
            "http://10.0.0.1:20002",
            "status",
            "/x/ckpt.pt",
        ])
        .unwrap();
        assert_eq!(args.authority_url.as_deref(), Some("http://10.0.0.1:20002"));
    }
}
