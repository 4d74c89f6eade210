//! SQLite storage layer.
//!
//! Provides:
//! - Table definitions and schema version migrations
//! - A shared connection pool
//! - The write queue, its update workers and the chunked upsert path
//! - The retention sweeper
//! - Access token maintenance

pub mod batch;
pub mod error;
pub mod migrate;
pub mod pool;
pub mod queue;
pub mod schema;
pub mod sweeper;
pub mod tokens;
pub mod worker;

pub use batch::{Batch, BatchConfig, BatchOutcome, Batcher, UpsertError};
pub use error::StorageError;
pub use migrate::{create_tables, ensure_schema, SchemaError, SchemaStatus, SCHEMA_VERSION};
pub use pool::{DbConnection, DbPool, PoolError, PoolSettings};
pub use queue::{write_queue, JobReceiver, QueueError, WriteQueue};
pub use schema::{drop_tables, EntityKind};
pub use sweeper::{Sweeper, SweeperConfig};
pub use worker::{Worker, WorkerConfig, WorkerHandle};
