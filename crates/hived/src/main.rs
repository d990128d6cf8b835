//! hived: the HiveGrid daemon.
//!
//! # Usage
//!
//! ```text
//! hived run --config /etc/hivegrid/hive.toml --data-dir /var/lib/hivegrid
//! hived check-config --config /etc/hivegrid/hive.toml
//! hived import --config /etc/hivegrid/hive.toml --data-dir /var/lib/hivegrid --file cluster.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use hive_core::{HiveConfig, Notifier};
use hivegrid_cluster::MembershipTracker;
use hivegrid_state::StateStore;
use hived::{Node, Seed, store_path};

#[derive(Parser)]
#[command(name = "hived", about = "HiveGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a group manager node until Ctrl-C.
    Run {
        /// Path to hive.toml.
        #[arg(long)]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/hivegrid")]
        data_dir: PathBuf,
    },
    /// Parse and validate a config file, then print it with defaults filled in.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
    /// Load local controllers and VM submissions from a JSON seed file.
    /// The node must not be running against the same data directory.
    Import {
        #[arg(long)]
        config: PathBuf,

        #[arg(long, default_value = "/var/lib/hivegrid")]
        data_dir: PathBuf,

        /// Seed file to load.
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hived=debug,hivegrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, data_dir } => run(config, data_dir).await,
        Command::CheckConfig { config } => {
            let config = HiveConfig::from_file(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Command::Import {
            config,
            data_dir,
            file,
        } => import(config, data_dir, file),
    }
}

async fn run(config: PathBuf, data_dir: PathBuf) -> anyhow::Result<()> {
    let config = HiveConfig::from_file(&config)?;
    info!(node = %config.node.id, "HiveGrid daemon starting");
    let node = Node::open(config, &data_dir)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal = tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            // without a handler the node runs until killed
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let result = node.run(shutdown_rx).await;
    signal.abort();
    info!("HiveGrid daemon stopped");
    result
}

fn import(config: PathBuf, data_dir: PathBuf, file: PathBuf) -> anyhow::Result<()> {
    let config = HiveConfig::from_file(&config)?;
    std::fs::create_dir_all(&data_dir)?;
    let store = StateStore::open(&store_path(&data_dir))?;
    let membership = MembershipTracker::new(Arc::new(store.clone()), Notifier::open(16), &config.node.id);

    let report = Seed::from_file(&file)?.apply(&store, &membership)?;
    println!(
        "{} hosts joined, {} refreshed, {} vms submitted, {} already known",
        report.joined, report.refreshed, report.submitted, report.already_known
    );
    Ok(())
}
