//! seekbot - Entry Point
//!
//! Loads configuration from the environment (.env supported), validates it,
//! and runs the Telegram dispatcher until interrupted.

use seekbot::Config;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("seekbot v{}", env!("CARGO_PKG_VERSION"));

    // Fail fast before any network connection
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            error!("Please ensure .env contains all required variables");
            std::process::exit(1);
        }
    };

    seekbot::telegram::run_bot(config).await
}
