//! Pooled SQLite connections shared by every component.
//!
//! Uses r2d2 with r2d2_sqlite. The pool is built once at startup and handed
//! to the workers, the sweeper and the schema manager; nothing holds a
//! process-wide handle. Connections are health-checked on checkout and
//! recycled once they pass the staleness timeout, so a dropped database
//! file handle is replaced transparently.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::error::StorageError;
use super::schema::apply_pragmas;

/// Pooled connection type handed out by [`DbPool`].
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Error type for pool construction.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to create connection pool: {0}")]
    PoolCreation(#[from] r2d2::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Connection pool settings supplied by configuration.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// Maximum number of connections in the pool
    pub max_size: u32,
    /// Connections older than this are recycled
    pub stale_timeout: Duration,
    /// How long a checkout waits for a free connection
    pub checkout_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 5,
            stale_timeout: Duration::from_secs(300),
            checkout_timeout: Duration::from_secs(30),
        }
    }
}

/// Connection pool for the write path.
#[derive(Clone)]
pub struct DbPool {
    pool: Pool<SqliteConnectionManager>,
}

impl DbPool {
    /// Create a new pool for the given database path.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created.
    pub fn new<P: AsRef<Path>>(db_path: P, settings: PoolSettings) -> Result<Self, PoolError> {
        let manager = SqliteConnectionManager::file(db_path);

        let pool = Pool::builder()
            .max_size(settings.max_size)
            .max_lifetime(Some(settings.stale_timeout))
            .connection_timeout(settings.checkout_timeout)
            .test_on_check_out(true)
            .connection_customizer(Box::new(WriterConnectionCustomizer))
            .build(manager)?;

        Ok(Self { pool })
    }

    /// Get a connection from the pool.
    pub fn get(&self) -> Result<DbConnection, StorageError> {
        Ok(self.pool.get()?)
    }
}

impl fmt::Debug for DbPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.pool.state();
        f.debug_struct("DbPool")
            .field("max_size", &self.pool.max_size())
            .field("connections", &state.connections)
            .field("idle_connections", &state.idle_connections)
            .finish()
    }
}

/// Connection customizer that applies write-path pragmas.
#[derive(Debug)]
struct WriterConnectionCustomizer;

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error>
    for WriterConnectionCustomizer
{
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        apply_pragmas(conn)
    }
}
