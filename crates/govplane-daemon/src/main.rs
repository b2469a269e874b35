#![deny(unsafe_code)]
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use govplane_daemon::AppContext;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "govplane-daemon", version, about = "MCP policy plane control daemon")]
struct Args {
    /// Enable verbose request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = govplane_config::load_from_env().context("loading configuration")?;

    let filter = if args.debug {
        EnvFilter::new(format!("govplane=debug,{}", config.log_level))
    } else {
        EnvFilter::new(config.log_level.clone())
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for warning in govplane_config::validate_config(&config).context("validating configuration")? {
        warn!(%warning, "configuration warning");
    }

    let ctx = Arc::new(AppContext::build(config));
    govplane_daemon::run(ctx).await
}
