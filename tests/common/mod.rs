//! Test utilities for Mapkeep integration tests.
//!
//! Provides:
//! - Temporary database fixtures
//! - Row counting and polling helpers

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use mapkeep::model::Spawn;
use mapkeep::storage::schema::initialize_schema;
use mapkeep::storage::{DbPool, PoolSettings};
use std::path::PathBuf;
use tempfile::TempDir;

/// Test fixture that manages a temporary database directory.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    /// Temporary directory for test database
    pub temp_dir: TempDir,
    /// Path to the database file
    pub db_path: PathBuf,
}

impl TestFixture {
    /// Create a new test fixture with a temporary database directory.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");
        Self { temp_dir, db_path }
    }

    /// Open a pool on the fixture database.
    pub fn pool(&self) -> DbPool {
        DbPool::new(&self.db_path, PoolSettings::default()).expect("failed to open pool")
    }

    /// Open a pool with every table created.
    pub fn initialized_pool(&self) -> DbPool {
        let pool = self.pool();
        initialize_schema(&pool.get().expect("no connection")).expect("failed to create tables");
        pool
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Route library logs to the test writer (errors only).
pub fn init() {
    mapkeep::observability::tracing::init_test_tracing();
}

/// Count rows in `table`.
pub fn count(pool: &DbPool, table: &str) -> i64 {
    pool.get()
        .expect("no connection")
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .expect("count failed")
}

/// `count` spawns that all disappear at `disappear`.
pub fn spawns(count: usize, disappear: DateTime<Utc>) -> Vec<Spawn> {
    (0..count)
        .map(|i| {
            let mut spawn = Spawn::new(
                format!("occ-{i:05}"),
                format!("sp-{}", i % 40),
                (i % 150) as u16 + 1,
                (40.0 + i as f64 * 1e-4, -74.0),
                disappear,
            );
            spawn.last_modified = Some(disappear - Duration::minutes(30));
            spawn
        })
        .collect()
}

/// Wait for a condition to become true with timeout.
///
/// # Returns
///
/// `true` if condition was met, `false` if timeout expired
pub async fn wait_for<F>(timeout: std::time::Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_creates_temp_dir() {
        let fixture = TestFixture::new();
        assert!(fixture.temp_dir.path().exists());
        assert!(fixture.db_path.ends_with("test.db"));
    }
}
