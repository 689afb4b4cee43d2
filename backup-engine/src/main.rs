//! Backup Engine - Main entry point
//!
//! Inspect, validate and restore backups in a catalog.

use anyhow::{bail, Context, Result};
use backup_engine::catalog::{BackupId, Catalog};
use backup_engine::restore::{RestoreRequest, Restorer};
use backup_engine::transfer::progress::format_bytes;
use backup_engine::validate::Validator;
use backup_engine::{config::Config, utils};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Instance name (overrides config)
    #[arg(short, long)]
    instance: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List backups, or show one backup in detail
    Show {
        #[arg(short, long)]
        backup: Option<BackupId>,
    },
    /// Validate one backup or the whole instance
    Validate {
        #[arg(short, long)]
        backup: Option<BackupId>,

        /// Mark backups whose chain is broken as ERROR
        #[arg(long)]
        mark_orphans: bool,
    },
    /// Restore a backup into an empty directory
    Restore {
        #[arg(short, long)]
        backup: BackupId,

        #[arg(short, long)]
        destination: PathBuf,

        /// Relocate a tablespace: OLD=NEW
        #[arg(short = 'T', long = "tablespace-mapping", value_parser = parse_mapping)]
        tablespace_mapping: Vec<(PathBuf, PathBuf)>,

        /// Skip validating the chain before restoring
        #[arg(long)]
        no_validate: bool,
    },
    /// Print the effective configuration
    Config,
}

fn parse_mapping(s: &str) -> std::result::Result<(PathBuf, PathBuf), String> {
    match s.split_once('=') {
        Some((old, new)) if !old.is_empty() && !new.is_empty() => {
            Ok((PathBuf::from(old), PathBuf::from(new)))
        }
        _ => Err(format!("invalid tablespace mapping \"{}\", expected OLD=NEW", s)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    if let Some(instance) = args.instance {
        config.catalog.instance = instance;
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let catalog = Catalog::open(
        &config.catalog.path,
        &config.catalog.instance,
        config.lock.stale_after(),
    )
    .with_context(|| format!("cannot open catalog at {}", config.catalog.path.display()))?;
    let validator = Validator::new(catalog.clone(), config.backup.jobs);

    match args.command {
        Command::Show { backup: None } => {
            println!(
                "{:<8} {:<8} {:<8} {:>4} {:<20} {:>12} {:<8}",
                "ID", "MODE", "PARENT", "TLI", "START", "DATA", "STATUS"
            );
            for record in catalog.list().await? {
                println!(
                    "{:<8} {:<8} {:<8} {:>4} {:<20} {:>12} {:<8}",
                    record.id.to_string(),
                    record.mode.to_string(),
                    record.parent_id.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    record.timeline_id.to_string(),
                    record.start_time.format("%Y-%m-%d %H:%M:%S").to_string(),
                    format_bytes(record.data_bytes),
                    record.status.to_string()
                );
            }
        }
        Command::Show { backup: Some(id) } => {
            let record = catalog.get(id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            match catalog.read_manifest(id).await {
                Ok(manifest) => println!(
                    "{} files, {} stored, {} removed since parent",
                    manifest.total_files,
                    format_bytes(manifest.total_bytes),
                    manifest.removed.len()
                ),
                Err(e) => println!("{}", e),
            }
        }
        Command::Validate {
            backup: Some(id),
            mark_orphans: _,
        } => {
            let report = validator.validate(id).await?;
            for issue in &report.issues {
                println!("{}: {}", issue.path, issue.problem);
            }
            println!("Backup {} is {}", id, report.status);
            if !report.is_ok() {
                bail!("backup {} is not valid", id);
            }
        }
        Command::Validate {
            backup: None,
            mark_orphans,
        } => {
            let report = validator.validate_instance().await?;
            for r in &report.reports {
                println!("{} {}", r.backup_id, r.status);
            }
            for b in &report.chain_breaks {
                println!("{} chain broken at {}: {}", b.backup, b.ancestor, b.reason);
            }
            if mark_orphans {
                for id in validator.mark_orphans(&report).await? {
                    println!("{} marked ERROR", id);
                }
            }
            if !report.is_ok() {
                bail!("some backups are not valid");
            }
        }
        Command::Restore {
            backup,
            destination,
            tablespace_mapping,
            no_validate,
        } => {
            let request = RestoreRequest {
                backup_id: backup,
                destination,
                tablespace_remap: tablespace_mapping.into_iter().collect::<BTreeMap<_, _>>(),
                verify: !no_validate,
            };
            let summary = Restorer::new(catalog, validator).restore(&request).await?;
            println!(
                "Restored {} files ({}) from a chain of {} backups",
                summary.files,
                format_bytes(summary.bytes_written),
                summary.chain.len()
            );
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}
