// float_cmp: only in tests where assert_eq! on f64 is intentional.
#![cfg_attr(test, allow(clippy::float_cmp))]

use anyhow::Result;
use tracing_subscriber::{self, EnvFilter};

use orakl_scanner::bots::supervisor::{Supervisor, SHUTDOWN_GRACE};
use orakl_scanner::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        symbols = config.watchlist.len(),
        bots = config.bots.len(),
        persisted = config.database_url.is_some(),
        "starting orakl-scanner"
    );

    let supervisor = Supervisor::start(config).await?;

    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    supervisor.shutdown(SHUTDOWN_GRACE).await;

    Ok(())
}
