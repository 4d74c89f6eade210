//! Retention sweeper.
//!
//! Periodically clears expired point-of-interest bonuses and, when a
//! retention window is configured, deletes spawns that disappeared longer
//! ago than the window. Runs as a tokio task; the database work of each
//! cycle runs on the blocking pool.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::error::StorageError;
use super::pool::DbPool;
use crate::observability::metrics::record_spawns_purged;

/// Sweeper timing and retention.
#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    /// Delay before the first cycle
    pub initial_delay: Duration,
    /// Time between cycles
    pub interval: Duration,
    /// Spawn retention in hours; zero or negative keeps spawns forever
    pub retention_hours: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(15),
            interval: Duration::from_secs(60),
            retention_hours: 0,
        }
    }
}

impl SweeperConfig {
    pub fn with_retention(retention_hours: i64) -> Self {
        Self {
            retention_hours,
            ..Self::default()
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub bonuses_cleared: usize,
    /// `None` when spawn retention is disabled
    pub spawns_purged: Option<usize>,
}

/// Clear bonus fields on every point of interest whose bonus has expired.
pub fn clear_expired_bonuses(conn: &Connection, now: DateTime<Utc>) -> Result<usize, StorageError> {
    let cleared = conn.execute(
        "UPDATE point_of_interest
         SET bonus_expiration = NULL, bonus_modifier = NULL
         WHERE bonus_expiration IS NOT NULL AND bonus_expiration < ?1",
        params![now.timestamp_millis()],
    )?;
    Ok(cleared)
}

/// Delete spawns that disappeared at or before `cutoff`.
pub fn purge_spawns(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
    let deleted = conn.execute(
        "DELETE FROM spawn WHERE disappear_time <= ?1",
        params![cutoff.timestamp_millis()],
    )?;
    Ok(deleted)
}

/// Run one sweep as of `now`.
pub fn run_cycle(
    conn: &Connection,
    now: DateTime<Utc>,
    retention_hours: i64,
) -> Result<SweepReport, StorageError> {
    let bonuses_cleared = clear_expired_bonuses(conn, now)?;
    if bonuses_cleared > 0 {
        tracing::debug!(count = bonuses_cleared, "Cleared expired bonuses");
    }

    let spawns_purged = if retention_hours > 0 {
        let start = Instant::now();
        let cutoff = now - ChronoDuration::hours(retention_hours);
        let deleted = purge_spawns(conn, cutoff)?;
        record_spawns_purged(deleted);
        tracing::info!(
            count = deleted,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Completed purge"
        );
        Some(deleted)
    } else {
        None
    };

    Ok(SweepReport {
        bonuses_cleared,
        spawns_purged,
    })
}

/// Background retention task.
pub struct Sweeper {
    pool: DbPool,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(pool: DbPool, config: SweeperConfig) -> Self {
        Self { pool, config }
    }

    /// Start the sweep loop. It exits once `shutdown` turns true.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(
            retention_hours = self.config.retention_hours,
            interval_secs = self.config.interval.as_secs(),
            "Retention sweeper started"
        );

        let mut delay = self.config.initial_delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            delay = self.config.interval;

            let pool = self.pool.clone();
            let retention_hours = self.config.retention_hours;
            let result = tokio::task::spawn_blocking(move || {
                let conn = pool.get()?;
                run_cycle(&conn, Utc::now(), retention_hours)
            })
            .await;

            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Retention sweep failed"),
                Err(e) => tracing::error!(error = %e, "Retention sweep task failed"),
            }
        }

        tracing::debug!("Retention sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pool::PoolSettings;
    use crate::storage::schema::{apply_pragmas, initialize_schema};
    use tempfile::TempDir;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        apply_pragmas(&conn).unwrap();
        initialize_schema(&conn).unwrap();
        conn
    }

    fn insert_spawn(conn: &Connection, id: &str, disappear: DateTime<Utc>) {
        conn.execute(
            "INSERT INTO spawn (occurrence_id, spawnpoint_id, species_id, latitude, longitude, disappear_time)
             VALUES (?1, 'sp', 1, 0.0, 0.0, ?2)",
            params![id, disappear.timestamp_millis()],
        )
        .unwrap();
    }

    fn insert_poi(conn: &Connection, id: &str, bonus_expiration: Option<DateTime<Utc>>) {
        let (expiration, modifier) = match bonus_expiration {
            Some(t) => (Some(t.timestamp_millis()), Some("501")),
            None => (None, None),
        };
        conn.execute(
            "INSERT INTO point_of_interest (poi_id, enabled, latitude, longitude, last_modified, bonus_expiration, bonus_modifier)
             VALUES (?1, 1, 0.0, 0.0, 0, ?2, ?3)",
            params![id, expiration, modifier],
        )
        .unwrap();
    }

    fn spawn_ids(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT occurrence_id FROM spawn ORDER BY occurrence_id")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_retention_boundary() {
        let conn = open();
        let now = Utc::now();
        let t = now - ChronoDuration::hours(1);
        insert_spawn(&conn, "at-boundary", t);
        insert_spawn(&conn, "just-inside", t + ChronoDuration::seconds(1));

        let report = run_cycle(&conn, now, 1).unwrap();
        assert_eq!(report.spawns_purged, Some(1));
        assert_eq!(spawn_ids(&conn), vec!["just-inside".to_string()]);
    }

    #[test]
    fn test_disabled_retention_keeps_spawns() {
        let conn = open();
        let now = Utc::now();
        insert_spawn(&conn, "old", now - ChronoDuration::days(30));

        for hours in [0, -5] {
            let report = run_cycle(&conn, now, hours).unwrap();
            assert_eq!(report.spawns_purged, None);
        }
        assert_eq!(spawn_ids(&conn).len(), 1);
    }

    #[test]
    fn test_expired_bonuses_cleared_regardless_of_retention() {
        let conn = open();
        let now = Utc::now();
        insert_poi(&conn, "expired", Some(now - ChronoDuration::minutes(1)));
        insert_poi(&conn, "active", Some(now + ChronoDuration::minutes(10)));
        insert_poi(&conn, "plain", None);

        let report = run_cycle(&conn, now, 0).unwrap();
        assert_eq!(report.bonuses_cleared, 1);

        let remaining: Vec<(String, Option<i64>, Option<String>)> = {
            let mut stmt = conn
                .prepare("SELECT poi_id, bonus_expiration, bonus_modifier FROM point_of_interest ORDER BY poi_id")
                .unwrap();
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap()
        };
        assert_eq!(remaining[0].0, "active");
        assert!(remaining[0].1.is_some() && remaining[0].2.is_some());
        assert_eq!(remaining[1], ("expired".to_string(), None, None));
        assert_eq!(remaining[2], ("plain".to_string(), None, None));
    }

    #[tokio::test]
    async fn test_sweeper_task_runs_and_stops() {
        let temp_dir = TempDir::new().unwrap();
        let pool = DbPool::new(temp_dir.path().join("test.db"), PoolSettings::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            initialize_schema(&conn).unwrap();
            insert_spawn(&conn, "old", Utc::now() - ChronoDuration::hours(3));
        }

        let config = SweeperConfig {
            initial_delay: Duration::from_millis(10),
            interval: Duration::from_millis(20),
            retention_hours: 1,
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Sweeper::new(pool.clone(), config).spawn(shutdown_rx);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let left: i64 = pool
                .get()
                .unwrap()
                .query_row("SELECT COUNT(*) FROM spawn", [], |row| row.get(0))
                .unwrap();
            if left == 0 || Instant::now() > deadline {
                assert_eq!(left, 0);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
