//! Service wiring and lifecycle.
//!
//! Builds the connection pool, checks the schema, then starts:
//! - `db_threads` update workers sharing one write queue
//! - the retention sweeper
//!
//! Shutdown drains the queue before stopping: every job submitted before
//! [`PersistenceService::shutdown`] is written.

use std::io::Write;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::storage::pool::{DbPool, PoolError, PoolSettings};
use crate::storage::queue::{write_queue, WriteQueue};
use crate::storage::sweeper::{Sweeper, SweeperConfig};
use crate::storage::worker::{Worker, WorkerConfig, WorkerHandle};
use crate::storage::{create_tables, drop_tables, tokens, SchemaError, StorageError};

/// Error type for service startup and maintenance commands.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<rusqlite::Error> for ServiceError {
    fn from(err: rusqlite::Error) -> Self {
        ServiceError::Storage(err.into())
    }
}

/// Runtime settings for [`PersistenceService`].
#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    pub workers: usize,
    pub worker: WorkerConfig,
    pub sweeper: SweeperConfig,
    /// How long shutdown waits for workers to drain the queue
    pub drain_timeout: Duration,
}

impl ServiceOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.db_threads.max(1),
            worker: WorkerConfig::default(),
            sweeper: SweeperConfig::with_retention(config.purge_data),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Pool settings derived from configuration.
///
/// Every worker keeps one connection checked out for its whole life, so the
/// pool always has room for all workers plus one shared connection for the
/// sweeper and maintenance work.
pub fn pool_settings(config: &Config) -> PoolSettings {
    let workers = u32::try_from(config.db_threads.max(1)).unwrap_or(u32::MAX);
    let max_size = config.db_max_connections.max(workers.saturating_add(1));
    if max_size > config.db_max_connections {
        tracing::warn!(
            configured = config.db_max_connections,
            workers,
            max_size,
            "Connection limit too small for the worker count, raising it"
        );
    }
    PoolSettings {
        max_size,
        stale_timeout: config.stale_timeout(),
        ..PoolSettings::default()
    }
}

/// Open the database and bring its schema up to date.
///
/// Fails with [`SchemaError::NewerThanSupported`] if the database was
/// written by a newer build.
pub fn open_database(config: &Config) -> Result<DbPool, ServiceError> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let pool = DbPool::new(&config.db_path, pool_settings(config))?;
    let mut conn = pool.get()?;
    let created = create_tables(&mut conn)?;
    if !created.is_empty() {
        tracing::info!(tables = ?created, "Created missing tables");
    }
    Ok(pool)
}

/// Running workers and sweeper around one write queue.
pub struct PersistenceService {
    queue: WriteQueue,
    workers: Vec<WorkerHandle>,
    sweeper: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
    drain_timeout: Duration,
}

impl PersistenceService {
    /// Start workers and the sweeper. Must be called inside a tokio runtime.
    pub fn start(pool: DbPool, options: ServiceOptions) -> Result<Self, ServiceError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (queue, jobs) = write_queue();

        let workers = (0..options.workers.max(1))
            .map(|id| Worker::spawn(id, pool.clone(), jobs.clone(), options.worker, stop_rx.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let sweeper = Sweeper::new(pool, options.sweeper).spawn(stop_rx);

        tracing::info!(
            workers = workers.len(),
            retention_hours = options.sweeper.retention_hours,
            "Persistence service started"
        );

        Ok(Self {
            queue,
            workers,
            sweeper,
            stop_tx,
            drain_timeout: options.drain_timeout,
        })
    }

    /// Producer handle; clone freely.
    pub fn queue(&self) -> &WriteQueue {
        &self.queue
    }

    /// Drain the queue, then stop every worker and the sweeper.
    pub async fn shutdown(self) {
        let count = self.workers.len();
        tracing::info!(
            workers = count,
            pending = self.queue.depth(),
            "Draining write queue"
        );
        self.queue.shutdown(count);

        let workers = self.workers;
        let mut joined = tokio::task::spawn_blocking(move || {
            for worker in workers {
                worker.join();
            }
        });

        let joined_result = match tokio::time::timeout(self.drain_timeout, &mut joined).await {
            Ok(result) => {
                let _ = self.stop_tx.send(true);
                result
            }
            Err(_) => {
                tracing::warn!(
                    pending = self.queue.depth(),
                    "Workers did not drain in time, stopping them"
                );
                let _ = self.stop_tx.send(true);
                joined.await
            }
        };
        if let Err(e) = joined_result {
            tracing::error!(error = %e, "Failed to join workers");
        }
        if let Err(e) = self.sweeper.await {
            tracing::error!(error = %e, "Sweeper task failed");
        }

        tracing::info!(
            max_queue_depth = self.queue.max_depth(),
            "Persistence service stopped"
        );
    }
}

/// Run the service until `shutdown_rx` fires.
pub async fn run_server(
    config: Config,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), ServiceError> {
    let pool = open_database(&config)?;
    let service = PersistenceService::start(pool, ServiceOptions::from_config(&config))?;

    let _ = shutdown_rx.changed().await;
    tracing::info!("Shutdown signal received, stopping service");

    service.shutdown().await;
    Ok(())
}

/// Run the one-shot maintenance command selected by `config`.
///
/// Output meant for the operator goes to `out`.
pub fn run_maintenance<W: Write>(config: &Config, out: &mut W) -> Result<(), ServiceError> {
    let pool = open_database(config)?;
    let mut conn = pool.get()?;

    if config.clear_db {
        let dropped = drop_tables(&conn)?;
        tracing::info!(tables = ?dropped, "Dropped tables");
        create_tables(&mut conn)?;
        writeln!(out, "Cleared database at {}", config.db_path.display())?;
    }

    if config.list_tokens {
        let tokens = tokens::list_tokens(&conn)?;
        if tokens.is_empty() {
            writeln!(out, "No access tokens")?;
        }
        for token in tokens {
            writeln!(out, "{}\t{}", token.name, token.token)?;
        }
    }

    if let Some(token) = &config.revoke_token {
        if tokens::revoke_token(&conn, token)? {
            writeln!(out, "Revoked {token}")?;
        } else {
            writeln!(out, "No such token: {token}")?;
        }
    }

    Ok(())
}
