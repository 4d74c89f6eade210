//! Mapkeep: persistence layer for a location-based game-data tracker.
//!
//! Scanners hand row sets for map entities (spawns, points of interest,
//! team-controlled structures, trainers) to a shared write queue; dedicated
//! worker threads drain the queue into SQLite in chunked upserts while a
//! retention sweeper keeps transient tables bounded.
//!
//! # Architecture
//!
//! - **Write queue**: unbounded multi-producer multi-consumer job queue
//! - **Upsert batcher**: 250-row chunks in one transaction, typed failure classification
//! - **Retention sweeper**: clears expired bonuses, purges stale spawns
//! - **Schema versions**: additive migrations gated by a stored version
//!
//! # Modules
//!
//! - [`config`]: CLI and environment configuration
//! - [`model`]: Entity records and their column encoding
//! - [`observability`]: Metrics and tracing setup
//! - [`server`]: Service wiring and graceful shutdown
//! - [`storage`]: SQLite persistence layer

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // storage::batch::BatchConfig is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::similar_names,              // lat/lon and friends are fine
    clippy::struct_excessive_bools,     // Config structs may have flags
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod config;
pub mod model;
pub mod observability;
pub mod server;
pub mod storage;
