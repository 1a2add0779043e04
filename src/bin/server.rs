//! Warden server binary.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use warden::config::WardenConfig;
use warden::registry::StoreBackend;

#[derive(Parser)]
#[command(name = "warden-server")]
#[command(about = "Byte-range lock manager with crash recovery")]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node name announced to clients
    #[arg(short, long, env = "WARDEN_NODE_NAME")]
    name: Option<String>,

    /// State directory (epoch and registrations)
    #[arg(long, env = "WARDEN_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Grace period in seconds
    #[arg(long, env = "WARDEN_GRACE_SECS")]
    grace_secs: Option<u64>,

    /// Keep registrations in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Metrics bind address
    #[arg(long, env = "WARDEN_METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load or create configuration
    let mut config = if let Some(config_path) = args.config {
        WardenConfig::from_file(&config_path)?
    } else {
        WardenConfig::development()
    };

    // Override with CLI args
    if let Some(name) = args.name {
        config.notifier.server_name = name.clone();
        config.node.name = name;
    }
    if let Some(state_dir) = args.state_dir {
        config.storage.state_dir = state_dir;
    }
    if let Some(secs) = args.grace_secs {
        config.grace.duration = Duration::from_secs(secs);
    }
    if args.ephemeral {
        config.registry.backend = StoreBackend::Memory;
    }
    if let Some(addr) = args.metrics_addr {
        config.observability.metrics_addr = addr.parse()?;
        config.observability.metrics_enabled = true;
    }
    if args.json_logs {
        config.observability.json_logs = true;
    }
    config.validate()?;

    // Run the server
    warden::run(config).await?;

    Ok(())
}
