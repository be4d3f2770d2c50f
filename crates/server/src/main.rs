// parleyd: multi-session chat server entry point.

use anyhow::Context;
use parley_server::config::ServerConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(&config.log_filter)).init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting parleyd");
    parley_server::runtime::run(config).await.context("parley server terminated unexpectedly")
}
