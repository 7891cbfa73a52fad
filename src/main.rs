//! nmt-pool CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use nmt_pool::DecoderError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit code when the decoder pool cannot start.
const EXIT_INITIALIZATION_FAILED: i32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments first to get log_level
    let cli = nmt_pool::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    if let Err(e) = nmt_pool::cli::run_with_cli(cli).await {
        if let Some(DecoderError::Initialization(reason)) = e.downcast_ref::<DecoderError>() {
            tracing::error!(reason = %reason, "Decoder pool failed to start");
            std::process::exit(EXIT_INITIALIZATION_FAILED);
        }
        return Err(e);
    }

    Ok(())
}
