//! appwarden daemon
//!
//! Application firewall using Netfilter Queue and nftables.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use std::path::PathBuf;

use appwarden::config::{Config, CONFIG_PATH};
use appwarden::daemon;

#[derive(Parser)]
#[command(name = "appwarden-daemon", version)]
#[command(about = "Application firewall daemon", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Log at debug level
    #[arg(long)]
    debug: bool,

    /// Use the in-memory filter backend and attach to no queue
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.debug {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.init();

    info!("appwarden daemon starting...");
    if !cli.dry_run && unsafe { libc::geteuid() } != 0 {
        bail!("appwarden-daemon must run as root (or with --dry-run)");
    }

    let config = Config::load(&cli.config);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    runtime.block_on(daemon::run(config, cli.dry_run))?;
    info!("Daemon stopped");
    Ok(())
}
