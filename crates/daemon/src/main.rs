use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::op::{Op, OpContext};
use cli::ops::{Compact, Recent, Serve, Stores, Version};
use depot_daemon::DaemonConfig;

crate::command_enum! {
    (Stores, Stores),
    (Compact, Compact),
    (Recent, Recent),
    (Serve, Serve),
    (Version, Version),
}

#[derive(Parser, Debug)]
#[command(name = "depot", version, about = "Blob storage engine for artifact repositories")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, env = "DEPOT_CONFIG", default_value = "depot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::load(&cli.config)?;
    init_tracing(&config.log_level);

    let ctx = OpContext {
        config_path: cli.config,
        config,
    };
    tracing::debug!(config = %ctx.config_path.display(), "loaded config");

    let output = cli.command.execute(&ctx).await?;
    println!("{output}");
    Ok(())
}
