//! Mapkeep: batched persistence for map entity scans.
//!
//! # Usage
//!
//! ```bash
//! mapkeep --db-path ./data/mapkeep.db --db-threads 2 --purge-data 24
//! mapkeep --list-tokens
//! ```
//!
//! Environment variables can also be used:
//! - `MAPKEEP_DB_PATH`: SQLite database file
//! - `MAPKEEP_DB_THREADS`: Number of update workers
//! - `MAPKEEP_PURGE_DATA`: Spawn retention in hours
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use anyhow::Context;
use mapkeep::config::Config;
use mapkeep::observability::metrics::init_metrics_with_endpoint;
use mapkeep::observability::tracing::init_tracing;
use mapkeep::server::{run_maintenance, run_server};
use tokio::sync::watch;

/// Print startup banner with version and configuration.
fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        r#"
  Mapkeep v{}

  Configuration:
    Database:   {}
    Workers:    {}
    Retention:  {}
    Log Level:  {}

  Press Ctrl+C to shutdown gracefully.
"#,
        version,
        config.db_path.display(),
        config.db_threads,
        if config.purge_data > 0 {
            format!("{} hours", config.purge_data)
        } else {
            "disabled".to_string()
        },
        config.log_level
    );
}

/// Resolve once SIGINT or SIGTERM arrives.
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for ctrl+c")?;
                tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl+c")?;
        tracing::info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse_args();

    init_tracing("mapkeep", Some(&config.log_level));
    init_metrics_with_endpoint(config.otel_endpoint.as_deref());

    if config.is_maintenance() {
        let mut stdout = std::io::stdout();
        return run_maintenance(&config, &mut stdout).context("maintenance command failed");
    }

    print_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            tracing::error!(error = %e, "Signal handling failed, shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    // A schema newer than this build ends up here and exits non-zero.
    run_server(config, shutdown_rx)
        .await
        .context("mapkeep stopped with an error")?;

    tracing::info!("Mapkeep shutdown complete");
    Ok(())
}
