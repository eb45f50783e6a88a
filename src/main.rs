//! Brickline - Journal-Based Replication for Distributed File Volumes
//!
//! Operator entry point: configuration management and offline journal
//! inspection for a brickline replica.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use brickline::config::BricklineConfig;
use brickline::journal::{open_term, term_range, ReplayCursor};

/// Brickline - Journal-Based Replication for Distributed File Volumes
#[derive(Parser)]
#[command(name = "brickline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "brickline.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "brickline.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "brick-1")]
        node_id: String,
    },

    /// Show node information
    Info,

    /// Inspect the term journal
    Scan {
        /// Decode every record instead of just counting them
        #[arg(long)]
        verbose: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Validate => run_validate(cli.config),
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Info => run_info(cli.config),
        Commands::Scan { verbose } => run_scan(cli.config, verbose),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    let config = BricklineConfig::from_file(&config_path)
        .with_context(|| format!("invalid configuration at {:?}", config_path))?;

    println!("Configuration is valid");
    println!("  Node ID: {}", config.node.id);
    println!("  Volume: {}", config.volume.name);
    println!("  Bricks: {}", config.volume.bricks.len());
    Ok(())
}

/// Write a starter configuration file
fn run_init(output: PathBuf, node_id: String) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("refusing to overwrite existing file {:?}", output);
    }

    let config = format!(
        r#"[node]
id = "{node_id}"
bind_address = "0.0.0.0:24007"
data_dir = "/var/lib/brickline"

[volume]
name = "vol0"
# The first brick is this node
bricks = ["{node_id}:24007"]

[replication]
# leader = true      # uncomment to pin the role; absent means auto
quorum_percent = 50.0
fsync_interval_secs = 5

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config)
        .with_context(|| format!("failed to write {:?}", output))?;
    println!("Wrote starter configuration to {:?}", output);
    Ok(())
}

/// Show node information
fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = BricklineConfig::from_file(&config_path)
        .with_context(|| format!("invalid configuration at {:?}", config_path))?;

    println!("Node ID: {}", config.node.id);
    println!("Bind address: {}", config.node.bind_address);
    println!("Volume: {}", config.volume.name);
    for (i, brick) in config.volume.bricks.iter().enumerate() {
        let tag = if i == 0 { " (local)" } else { "" };
        println!("  Brick {}: {}{}", i, brick, tag);
    }
    match config.replication.leader {
        Some(true) => println!("Role: leader (pinned)"),
        Some(false) => println!("Role: follower (pinned)"),
        None => println!("Role: auto (derived from liveness)"),
    }
    println!("Quorum: {}%", config.replication.quorum_percent);
    println!("Journal directory: {:?}", config.journal_dir());
    Ok(())
}

/// Inspect the term journal on disk
fn run_scan(config_path: PathBuf, verbose: bool) -> anyhow::Result<()> {
    let config = BricklineConfig::from_file(&config_path)
        .with_context(|| format!("invalid configuration at {:?}", config_path))?;
    let dir = config.journal_dir();

    let range = term_range(&dir)
        .with_context(|| format!("failed to scan journal at {:?}", dir))?;

    println!("Journal at {:?}", dir);
    println!("  Terms on disk: {}..={}", range.first, range.last);
    println!("  Replayable from term: {}", range.contiguous_from);

    for term in range.contiguous_from..=range.last {
        let segment = open_term(&dir, term)
            .with_context(|| format!("failed to open term {}", term))?;
        println!("  Term {}: {} records", term, segment.valid_records());

        if verbose {
            let mut cursor = ReplayCursor::open(&dir, term)?;
            while let Some(record) = cursor.decode_next()? {
                let tag = if record.is_rollback() { " [rollback]" } else { "" };
                println!(
                    "    {}.{} {:?} file={}{}",
                    record.header.term,
                    record.header.index,
                    record.header.kind,
                    record.header.target,
                    tag
                );
            }
        }
    }

    Ok(())
}
