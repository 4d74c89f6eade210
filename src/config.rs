//! Configuration parsing for the Mapkeep service.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - Sensible defaults for quick start

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Mapkeep: batched persistence for map entity scans.
#[derive(Parser, Debug, Clone)]
#[command(name = "mapkeep")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Path to the SQLite database file
    #[arg(long, env = "MAPKEEP_DB_PATH", default_value = "./data/mapkeep.db")]
    pub db_path: PathBuf,

    /// Maximum number of pooled database connections
    #[arg(long, env = "MAPKEEP_DB_MAX_CONNECTIONS", default_value_t = 5)]
    pub db_max_connections: u32,

    /// Seconds after which a pooled connection is considered stale and recycled
    #[arg(long, env = "MAPKEEP_DB_STALE_TIMEOUT", default_value_t = 300)]
    pub db_stale_timeout_secs: u64,

    /// Number of database writer threads draining the write queue
    #[arg(long, env = "MAPKEEP_DB_THREADS", default_value_t = 1)]
    pub db_threads: usize,

    /// Delete spawns that disappeared more than this many hours ago (0 disables)
    #[arg(long, env = "MAPKEEP_PURGE_DATA", default_value_t = 0, allow_negative_numbers = true)]
    pub purge_data: i64,

    /// Log filter directives (e.g. "info" or "warn,mapkeep=debug")
    #[arg(long, env = "RUST_LOG", default_value = "info,mapkeep=debug")]
    pub log_level: String,

    /// Drop and recreate all data tables, then exit
    #[arg(long)]
    pub clear_db: bool,

    /// List stored access tokens, then exit
    #[arg(long)]
    pub list_tokens: bool,

    /// Revoke a stored access token, then exit
    #[arg(long, value_name = "TOKEN")]
    pub revoke_token: Option<String>,

    /// OpenTelemetry collector endpoint for metrics export (optional)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Staleness timeout as a duration.
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.db_stale_timeout_secs)
    }

    /// Whether one of the one-shot maintenance flags was given.
    pub fn is_maintenance(&self) -> bool {
        self.clear_db || self.list_tokens || self.revoke_token.is_some()
    }

    /// Create a default configuration for testing.
    pub fn test_config(db_path: PathBuf) -> Self {
        Self {
            db_path,
            db_max_connections: 4,
            log_level: "debug".into(),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/mapkeep.db"),
            db_max_connections: 5,
            db_stale_timeout_secs: 300,
            db_threads: 1,
            purge_data: 0,
            log_level: "info,mapkeep=debug".into(),
            clear_db: false,
            list_tokens: false,
            revoke_token: None,
            otel_endpoint: None,
        }
    }
}
