//! Burrow relay: public endpoint of the reverse HTTP tunnel.

use anyhow::Result;
use clap::Parser;
use tracing::info;

use burrow_relay::config::RelayConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the relay configuration file
    #[arg(short, long, default_value = "configs/relay.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = RelayConfig::load(&args.config)?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting burrow relay");
    burrow_relay::server::run(config).await
}
