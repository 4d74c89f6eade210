//! Database update workers.
//!
//! Each worker is a dedicated OS thread that holds one pooled connection
//! and drains the shared write queue:
//!
//! 1. Acquire a connection, retrying every few seconds until one is available
//! 2. Block on the queue for the next row set
//! 3. Upsert it through the [`Batcher`], then mark the job complete
//!
//! Errors and panics inside one iteration are logged, followed by a pause,
//! and the loop resumes. A worker stops when it receives a shutdown
//! message (queued behind pending jobs) or the stop flag is raised while it
//! is waiting.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::batch::{BatchConfig, Batcher, UpsertError};
use super::pool::{DbConnection, DbPool};
use super::queue::{Job, JobReceiver, QueueMessage};

/// Queue depth above which backpressure warnings are emitted.
pub const DEFAULT_BACKPRESSURE_THRESHOLD: usize = 50;

/// Worker tuning. Defaults match production behavior.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub batch: BatchConfig,
    /// Delay between connection attempts
    pub reconnect_delay: Duration,
    /// Pause after an iteration fails
    pub error_pause: Duration,
    pub backpressure_threshold: usize,
    /// Minimum time between two backpressure warnings
    pub backpressure_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            reconnect_delay: Duration::from_secs(5),
            error_pause: Duration::from_secs(5),
            backpressure_threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
            backpressure_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    /// Short delays for tests.
    pub fn test_config() -> Self {
        Self {
            batch: BatchConfig::test_config(),
            reconnect_delay: Duration::from_millis(20),
            error_pause: Duration::from_millis(20),
            ..Self::default()
        }
    }
}

/// Rate-limited warning for a growing queue.
#[derive(Debug)]
pub struct BackpressureMonitor {
    threshold: usize,
    interval: Duration,
    last_warning: Option<Instant>,
}

impl BackpressureMonitor {
    pub fn new(threshold: usize, interval: Duration) -> Self {
        Self {
            threshold,
            interval,
            last_warning: None,
        }
    }

    /// Returns true when a warning should be emitted for `depth` at `now`.
    pub fn should_warn(&mut self, depth: usize, now: Instant) -> bool {
        if depth <= self.threshold {
            return false;
        }
        match self.last_warning {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_warning = Some(now);
                true
            }
        }
    }

    fn check(&mut self, depth: usize) {
        if self.should_warn(depth, Instant::now()) {
            tracing::warn!(
                depth,
                threshold = self.threshold,
                "Write queue is backing up, database may be overloaded"
            );
        }
    }
}

/// Result of one loop iteration.
enum Step {
    Continue,
    Stop,
}

/// Handle to a running worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker thread to exit.
    pub fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!(worker = %self.name, "Worker thread panicked");
        }
    }
}

/// A database update worker.
pub struct Worker {
    name: String,
    pool: DbPool,
    jobs: JobReceiver,
    batcher: Batcher,
    config: WorkerConfig,
    stop: watch::Receiver<bool>,
    backpressure: BackpressureMonitor,
    conn: Option<DbConnection>,
}

impl Worker {
    /// Start worker number `id` on its own thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(
        id: usize,
        pool: DbPool,
        jobs: JobReceiver,
        config: WorkerConfig,
        stop: watch::Receiver<bool>,
    ) -> std::io::Result<WorkerHandle> {
        let name = format!("db-updater-{id}");
        let worker = Worker {
            name: name.clone(),
            pool,
            jobs,
            batcher: Batcher::new(config.batch),
            config,
            stop,
            backpressure: BackpressureMonitor::new(
                config.backpressure_threshold,
                config.backpressure_interval,
            ),
            conn: None,
        };

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run())?;

        Ok(WorkerHandle { name, handle })
    }

    fn run(mut self) {
        tracing::debug!(worker = %self.name, "Worker started");

        loop {
            match catch_unwind(AssertUnwindSafe(|| self.step())) {
                Ok(Ok(Step::Continue)) => {}
                Ok(Ok(Step::Stop)) => break,
                Ok(Err(e)) => {
                    tracing::error!(worker = %self.name, error = %e, "Failed to write batch");
                    if e.is_connection_lost() {
                        self.conn = None;
                    }
                    if !self.pause(self.config.error_pause) {
                        break;
                    }
                }
                Err(panic) => {
                    tracing::error!(
                        worker = %self.name,
                        panic = %panic_message(panic.as_ref()),
                        "Worker iteration panicked"
                    );
                    self.conn = None;
                    if !self.pause(self.config.error_pause) {
                        break;
                    }
                }
            }
        }

        tracing::debug!(worker = %self.name, "Worker stopped");
    }

    fn step(&mut self) -> Result<Step, UpsertError> {
        if self.conn.is_none() && !self.connect() {
            return Ok(Step::Stop);
        }

        let job = match self.jobs.recv_blocking() {
            Some(QueueMessage::Job(job)) => job,
            Some(QueueMessage::Shutdown) | None => return Ok(Step::Stop),
        };

        self.backpressure.check(self.jobs.depth());
        self.process(&job)?;
        Ok(Step::Continue)
    }

    fn process(&mut self, job: &Job) -> Result<(), UpsertError> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        let outcome = self.batcher.upsert(conn, job.batch())?;
        if outcome.skipped_rows > 0 {
            tracing::warn!(
                worker = %self.name,
                entity = %job.batch().kind(),
                skipped_rows = outcome.skipped_rows,
                "Dropped rows that could not be stored"
            );
        }
        Ok(())
    }

    /// Acquire a connection, retrying until one is available.
    ///
    /// Returns false if the stop flag was raised while waiting.
    fn connect(&mut self) -> bool {
        loop {
            if self.stopped() {
                return false;
            }
            match self.pool.get() {
                Ok(conn) => {
                    tracing::debug!(worker = %self.name, "Acquired database connection");
                    self.conn = Some(conn);
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        worker = %self.name,
                        error = %e,
                        retry_in_secs = self.config.reconnect_delay.as_secs_f64(),
                        "Cannot connect to database, retrying"
                    );
                    if !self.pause(self.config.reconnect_delay) {
                        return false;
                    }
                }
            }
        }
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Sleep for `duration` unless stopped first. Returns false if stopped.
    fn pause(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(50);
        let deadline = Instant::now() + duration;
        loop {
            if self.stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLICE.min(deadline - now));
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Spawn, Team, Trainer};
    use crate::storage::batch::Batch;
    use crate::storage::pool::PoolSettings;
    use crate::storage::queue::write_queue;
    use crate::storage::schema::initialize_schema;
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::TempDir;

    fn setup() -> (TempDir, DbPool) {
        let temp_dir = TempDir::new().unwrap();
        let pool = DbPool::new(temp_dir.path().join("test.db"), PoolSettings::default()).unwrap();
        initialize_schema(&pool.get().unwrap()).unwrap();
        (temp_dir, pool)
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn count(pool: &DbPool, table: &str) -> i64 {
        pool.get()
            .unwrap()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_backpressure_warns_at_most_once_per_interval() {
        let mut monitor = BackpressureMonitor::new(50, Duration::from_secs(1));
        let start = Instant::now();

        assert!(!monitor.should_warn(50, start));
        assert!(monitor.should_warn(51, start));
        assert!(!monitor.should_warn(80, start + Duration::from_millis(500)));
        assert!(monitor.should_warn(80, start + Duration::from_millis(1001)));
    }

    #[test]
    fn test_worker_drains_queue_and_stops_on_shutdown() {
        let (_temp_dir, pool) = setup();
        let (queue, jobs) = write_queue();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = Worker::spawn(0, pool.clone(), jobs, WorkerConfig::test_config(), stop_rx)
            .unwrap();
        assert_eq!(handle.name(), "db-updater-0");

        let disappear = Utc::now() + ChronoDuration::minutes(10);
        let spawns: Vec<Spawn> = (0..600)
            .map(|i| Spawn::new(format!("enc-{i}"), "sp", 1, (1.0, 2.0), disappear))
            .collect();
        queue.submit_entities(spawns).unwrap();
        queue.shutdown(1);

        handle.join();
        assert_eq!(queue.depth(), 0);
        assert_eq!(count(&pool, "spawn"), 600);
    }

    #[test]
    fn test_bad_rows_do_not_stop_the_worker() {
        let (_temp_dir, pool) = setup();
        let (queue, jobs) = write_queue();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = Worker::spawn(1, pool.clone(), jobs, WorkerConfig::test_config(), stop_rx)
            .unwrap();

        let bad = Spawn::new("bad", "sp", 1, (95.0, 2.0), Utc::now());
        queue.submit(Batch::from_entities(vec![bad])).unwrap();
        queue
            .submit_entities(vec![Trainer {
                name: "ash".into(),
                team: Team::C,
                level: 12,
                last_seen: Utc::now(),
            }])
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || queue.depth() == 0));
        assert_eq!(count(&pool, "spawn"), 0);
        assert_eq!(count(&pool, "trainer"), 1);

        queue.shutdown(1);
        handle.join();
    }

    #[test]
    fn test_jobs_are_shared_between_workers() {
        let (_temp_dir, pool) = setup();
        let (queue, jobs) = write_queue();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handles: Vec<_> = (0..3)
            .map(|id| {
                Worker::spawn(
                    id,
                    pool.clone(),
                    jobs.clone(),
                    WorkerConfig::test_config(),
                    stop_rx.clone(),
                )
                .unwrap()
            })
            .collect();

        for i in 0..30 {
            let trainer = Trainer {
                name: format!("trainer-{i}"),
                team: Team::A,
                level: 5,
                last_seen: Utc::now(),
            };
            queue.submit_entities(vec![trainer]).unwrap();
        }
        queue.shutdown(handles.len());
        for handle in handles {
            handle.join();
        }

        assert_eq!(count(&pool, "trainer"), 30);
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_stop_flag_interrupts_reconnect_loop() {
        let temp_dir = TempDir::new().unwrap();
        let settings = PoolSettings {
            max_size: 1,
            checkout_timeout: Duration::from_millis(50),
            ..PoolSettings::default()
        };
        let pool = DbPool::new(temp_dir.path().join("test.db"), settings).unwrap();
        // Hold the only connection so every checkout by the worker times out.
        let _held = pool.get().unwrap();

        let (_queue, jobs) = write_queue();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle =
            Worker::spawn(0, pool.clone(), jobs, WorkerConfig::test_config(), stop_rx).unwrap();

        std::thread::sleep(Duration::from_millis(200));
        assert!(!handle.is_finished());

        stop_tx.send(true).unwrap();
        assert!(wait_until(Duration::from_secs(5), || handle.is_finished()));
        handle.join();
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
