//! Matchclock HTTP server
//!
//! Configured through `MATCHCLOCK_*` environment variables; logs filtered by
//! `RUST_LOG`.

use std::process::ExitCode;

use matchclock_runtime::{init_tracing, serve, RuntimeConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("matchclock-server: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_tracing(config.log_format) {
        eprintln!("matchclock-server: {}", e);
        return ExitCode::FAILURE;
    }

    match serve(config, shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
