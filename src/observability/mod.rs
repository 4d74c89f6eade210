//! Observability infrastructure.
//!
//! Provides:
//! - Structured logging through `tracing`
//! - OpenTelemetry metrics for the write path, queue and sweeper

pub mod metrics;
pub mod tracing;
