//! Chunked upsert of row sets.
//!
//! A call writes one [`Batch`] inside a single transaction:
//! - Rows are split into chunks of at most 250 (per-statement parameter limits)
//! - Each chunk is one multi-row upsert inside its own SAVEPOINT, so a
//!   failed chunk never leaves half its rows behind
//! - Data-shape failures drop the chunk and move on to the next one
//! - Transient failures retry the chunk with a fixed delay, then abort the call
//!
//! Foreign key enforcement is off for the whole call: scanners routinely
//! deliver children (creature instances) before their parents (trainers).

use indexmap::IndexMap;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Transaction};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::error::StorageError;
use super::schema::{EntityKind, Row, TableDef};
use crate::model::Entity;
use crate::observability::metrics::{record_chunk_failure, record_upsert};

/// Rows per write statement.
pub const DEFAULT_CHUNK_SIZE: usize = 250;

/// Retries granted to a chunk failing with a transient error.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Pause between retries of the same chunk.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Configuration for chunked upserts.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Maximum number of rows per statement
    pub chunk_size: usize,
    /// Retries per chunk before the call is abandoned
    pub max_retries: u32,
    /// Delay before retrying a chunk
    pub retry_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl BatchConfig {
    /// Create a test config that keeps the default chunking but barely waits.
    pub fn test_config() -> Self {
        Self {
            retry_delay: Duration::from_millis(1),
            ..Self::default()
        }
    }
}

/// Row set for one entity type, keyed by primary identity.
#[derive(Debug, Clone)]
pub struct Batch {
    kind: EntityKind,
    rows: IndexMap<String, Row>,
}

impl Batch {
    /// Build a batch from typed records.
    ///
    /// Records sharing a key collapse to the last one supplied.
    pub fn from_entities<T, I>(entities: I) -> Self
    where
        T: Entity,
        I: IntoIterator<Item = T>,
    {
        let rows = entities
            .into_iter()
            .map(|entity| (entity.key(), entity.to_row()))
            .collect();
        Self {
            kind: T::KIND,
            rows,
        }
    }

    /// Build a batch from rows already encoded in table column order.
    pub fn from_rows(kind: EntityKind, rows: IndexMap<String, Row>) -> Self {
        Self { kind, rows }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Split into chunks of at most `size` rows, in insertion order.
    fn chunks(&self, size: usize) -> Vec<Vec<&Row>> {
        let rows: Vec<&Row> = self.rows.values().collect();
        rows.chunks(size.max(1)).map(<[&Row]>::to_vec).collect()
    }
}

/// Summary of a completed upsert call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Rows inserted or overwritten
    pub written: usize,
    /// Chunks attempted
    pub chunks: usize,
    /// Chunks dropped because of data-shape errors
    pub skipped_chunks: usize,
    /// Rows in the dropped chunks
    pub skipped_rows: usize,
}

/// Failure of a whole upsert call.
#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("failed to start {kind} write: {source}")]
    Begin {
        kind: EntityKind,
        source: StorageError,
    },

    #[error("{kind} chunk {chunk} failed after {attempts} attempts ({written} rows kept): {source}")]
    RetriesExhausted {
        kind: EntityKind,
        chunk: usize,
        attempts: u32,
        written: usize,
        source: StorageError,
    },

    #[error("failed to commit {kind} write: {source}")]
    Commit {
        kind: EntityKind,
        source: StorageError,
    },
}

impl UpsertError {
    /// Underlying storage failure.
    pub fn storage_error(&self) -> &StorageError {
        match self {
            UpsertError::Begin { source, .. }
            | UpsertError::RetriesExhausted { source, .. }
            | UpsertError::Commit { source, .. } => source,
        }
    }

    /// Whether the connection used for the call should be discarded.
    pub fn is_connection_lost(&self) -> bool {
        self.storage_error().is_connection_lost()
    }
}

/// How a chunk ended up failing.
enum ChunkFailure {
    /// Data-shape error; the chunk was dropped
    Skipped,
    /// Transient error that outlived its retries
    Exhausted { attempts: u32, source: StorageError },
}

/// Writes batches in bounded chunks with per-chunk failure handling.
#[derive(Debug, Clone, Copy, Default)]
pub struct Batcher {
    config: BatchConfig,
}

impl Batcher {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Upsert every row of `batch`.
    pub fn upsert(&self, conn: &mut Connection, batch: &Batch) -> Result<BatchOutcome, UpsertError> {
        self.upsert_with(conn, batch, write_chunk)
    }

    /// Upsert using a custom chunk writer.
    ///
    /// `write` runs once per chunk attempt inside that chunk's savepoint.
    pub fn upsert_with<F>(
        &self,
        conn: &mut Connection,
        batch: &Batch,
        mut write: F,
    ) -> Result<BatchOutcome, UpsertError>
    where
        F: FnMut(&Connection, &TableDef, &[&Row]) -> Result<usize, StorageError>,
    {
        let kind = batch.kind();
        let mut outcome = BatchOutcome::default();
        if batch.is_empty() {
            return Ok(outcome);
        }

        let start = Instant::now();
        conn.pragma_update(None, "foreign_keys", false)
            .map_err(|e| UpsertError::Begin {
                kind,
                source: e.into(),
            })?;

        let result = self.write_chunks(conn, batch, &mut outcome, &mut write);

        if let Err(e) = conn.pragma_update(None, "foreign_keys", true) {
            tracing::warn!(error = %e, "Failed to restore foreign key enforcement");
        }

        let written = match &result {
            Ok(()) => outcome.written,
            Err(UpsertError::RetriesExhausted { written, .. }) => *written,
            Err(_) => 0,
        };
        let elapsed = start.elapsed();
        record_upsert(kind, written, elapsed.as_secs_f64());
        tracing::debug!(
            entity = %kind,
            rows = written,
            chunks = outcome.chunks,
            skipped_rows = outcome.skipped_rows,
            failed = result.is_err(),
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "Upserted rows"
        );
        result.map(|()| outcome)
    }

    fn write_chunks<F>(
        &self,
        conn: &mut Connection,
        batch: &Batch,
        outcome: &mut BatchOutcome,
        write: &mut F,
    ) -> Result<(), UpsertError>
    where
        F: FnMut(&Connection, &TableDef, &[&Row]) -> Result<usize, StorageError>,
    {
        let kind = batch.kind();
        let total = batch.len();
        let mut tx = conn.transaction().map_err(|e| UpsertError::Begin {
            kind,
            source: e.into(),
        })?;

        let mut offset = 0;
        for (index, chunk) in batch.chunks(self.config.chunk_size).iter().enumerate() {
            tracing::debug!(
                entity = %kind,
                from = offset,
                to = (offset + chunk.len()).min(total),
                "Inserting items"
            );
            outcome.chunks += 1;

            match self.write_chunk_with_retry(&mut tx, kind, index, chunk, write) {
                Ok(written) => outcome.written += written,
                Err(ChunkFailure::Skipped) => {
                    outcome.skipped_chunks += 1;
                    outcome.skipped_rows += chunk.len();
                }
                Err(ChunkFailure::Exhausted { attempts, source }) => {
                    // Chunks that already made it stay written.
                    let written = match tx.commit() {
                        Ok(()) => outcome.written,
                        Err(e) => {
                            tracing::warn!(entity = %kind, error = %e, "Failed to commit partial batch");
                            0
                        }
                    };
                    return Err(UpsertError::RetriesExhausted {
                        kind,
                        chunk: index,
                        attempts,
                        written,
                        source,
                    });
                }
            }
            offset += chunk.len();
        }

        tx.commit().map_err(|e| UpsertError::Commit {
            kind,
            source: e.into(),
        })
    }

    fn write_chunk_with_retry<F>(
        &self,
        tx: &mut Transaction<'_>,
        kind: EntityKind,
        index: usize,
        chunk: &[&Row],
        write: &mut F,
    ) -> Result<usize, ChunkFailure>
    where
        F: FnMut(&Connection, &TableDef, &[&Row]) -> Result<usize, StorageError>,
    {
        let table = kind.table();
        let mut retries = 0;
        loop {
            let err = match attempt_chunk(tx, table, chunk, write) {
                Ok(written) => return Ok(written),
                Err(err) => err,
            };
            record_chunk_failure(kind, err.class());

            if err.is_unrecoverable() {
                tracing::error!(
                    entity = %kind,
                    chunk = index,
                    error = %err,
                    data = %chunk_to_json(table, chunk),
                    "Unrecoverable error writing chunk, dropping its rows"
                );
                return Err(ChunkFailure::Skipped);
            }

            if retries >= self.config.max_retries {
                tracing::warn!(
                    entity = %kind,
                    chunk = index,
                    error = %err,
                    data = %chunk_to_json(table, chunk),
                    "Giving up on chunk after repeated transient errors"
                );
                return Err(ChunkFailure::Exhausted {
                    attempts: retries + 1,
                    source: err,
                });
            }

            retries += 1;
            tracing::warn!(
                entity = %kind,
                chunk = index,
                retry = retries,
                max_retries = self.config.max_retries,
                error = %err,
                "Transient error writing chunk, retrying"
            );
            std::thread::sleep(self.config.retry_delay);
        }
    }
}

/// One attempt at a chunk, isolated in a savepoint.
fn attempt_chunk<F>(
    tx: &mut Transaction<'_>,
    table: &TableDef,
    chunk: &[&Row],
    write: &mut F,
) -> Result<usize, StorageError>
where
    F: FnMut(&Connection, &TableDef, &[&Row]) -> Result<usize, StorageError>,
{
    let savepoint = tx.savepoint()?;
    // Dropping the savepoint on error rolls the chunk back.
    let written = write(&*savepoint, table, chunk)?;
    savepoint.commit()?;
    Ok(written)
}

/// Issue the multi-row upsert statement for one chunk.
pub fn write_chunk(
    conn: &Connection,
    table: &TableDef,
    rows: &[&Row],
) -> Result<usize, StorageError> {
    let width = table.columns.len();
    if let Some((index, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != width) {
        return Err(StorageError::MalformedRow(format!(
            "row {index} has {} values, {} expects {width}",
            row.len(),
            table.name
        )));
    }

    let sql = table.upsert_sql(rows.len());
    let mut stmt = conn.prepare_cached(&sql)?;
    let written = stmt.execute(params_from_iter(rows.iter().flat_map(|row| row.iter())))?;
    Ok(written)
}

/// Render a chunk as a JSON array of column → value objects for logging.
fn chunk_to_json(table: &TableDef, rows: &[&Row]) -> String {
    let records: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            let record: serde_json::Map<String, serde_json::Value> = table
                .columns
                .iter()
                .map(|c| (*c).to_string())
                .zip(row.iter().map(value_to_json))
                .collect();
            serde_json::Value::Object(record)
        })
        .collect();
    serde_json::to_string(&records).unwrap_or_default()
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Real(f) => serde_json::Value::from(*f),
        Value::Text(s) => serde_json::Value::from(s.as_str()),
        Value::Blob(b) => serde_json::Value::from(format!("<{} bytes>", b.len())),
    }
}
