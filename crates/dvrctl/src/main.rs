//! dvrctl — operator tool for the dvrgrid binding store.
//!
//! # Usage
//!
//! ```text
//! dvrctl --config /etc/dvrgrid/dvrgrid.toml bindings --router r1 --json
//! dvrctl release-snat r1 --agent a1
//! dvrctl purge-agent a1
//! dvrctl init-config > dvrgrid.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

use dvr_core::DvrConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "dvrctl",
    about = "Inspect and repair distributed router bindings",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to dvrgrid.toml (defaults apply when absent).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the binding store path from the config.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List SNAT and host bindings
    Bindings {
        /// Only show bindings of this router
        #[arg(short, long)]
        router: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Release a router's centralized SNAT binding
    ///
    /// The SNAT agent keeps its host binding for the router unless
    /// --drop-host-binding is given.
    ReleaseSnat {
        router: String,
        /// Only release if the SNAT is hosted by this agent
        #[arg(short, long)]
        agent: Option<String>,
        /// Also delete the SNAT agent's host binding in the same transaction
        #[arg(long)]
        drop_host_binding: bool,
    },
    /// Delete every binding of a removed L3 agent
    PurgeAgent { agent: String },
    /// Print a default dvrgrid.toml
    InitConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DvrConfig::from_file(path)?,
        None => DvrConfig::default(),
    };
    if let Some(store) = cli.store {
        config.store.path = store;
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.filter))?,
        )
        .init();
    debug!(store = ?config.store.path, "configuration loaded");

    match cli.command {
        Commands::Bindings { router, json } => {
            commands::bindings::list(&config, router.as_deref(), json)
        }
        Commands::ReleaseSnat {
            router,
            agent,
            drop_host_binding,
        } => commands::repair::release_snat(&config, &router, agent.as_deref(), drop_host_binding),
        Commands::PurgeAgent { agent } => commands::repair::purge_agent(&config, &agent),
        Commands::InitConfig => commands::init_config(),
    }
}
