//! cachetd - Cachet daemon.
//!
//! Loads the pool policy configuration, verifies the resctrl control
//! filesystem is mounted (fatal if not), and materializes the OS and
//! infra groups and the configured partition layout.

use std::path::PathBuf;

use anyhow::Context;
use cachet::Engine;
use cachet_common::CachetConfig;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(long, env = "CACHETD_CONFIG", default_value = "/etc/cachet/cachet.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if !rustix::process::geteuid().is_root() {
        tracing::warn!("Not running as root; resctrl writes will likely be denied");
    }

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let config: CachetConfig =
        toml::from_str(&raw).with_context(|| format!("parsing {}", args.config.display()))?;

    // A control root that is not resctrl-mounted is fatal.
    let mut engine = Engine::bootstrap(&config)
        .with_context(|| format!("opening resctrl at {}", config.resctrl_root().display()))?;

    engine.setup_os_group().context("applying OS group")?;
    engine
        .setup_infra_group()
        .context("applying infra group")?;

    let associations = engine.associations(None).context("reading associations")?;
    tracing::info!(
        groups = associations.len(),
        free_classes = engine.registry().count_available(),
        "cachetd ready - partition layout applied"
    );

    Ok(())
}
