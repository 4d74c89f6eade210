//! OpenTelemetry metrics.
//!
//! Key metrics:
//! - mapkeep_rows_written_total: Counter of rows upserted, by entity
//! - mapkeep_upsert_latency_seconds: Histogram of upsert call latency, by entity
//! - mapkeep_chunk_failures_total: Counter of failed chunk attempts, by entity and class
//! - mapkeep_queue_depth: Gauge of outstanding write jobs
//! - mapkeep_queue_depth_max: Gauge of the highest depth seen
//! - mapkeep_spawns_purged_total: Counter of spawns removed by retention
//!
//! Recording before [`init_metrics`] is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

use crate::storage::schema::EntityKind;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metric instruments.
#[derive(Debug)]
pub struct Metrics {
    pub rows_written: Counter<u64>,
    pub upsert_latency: Histogram<f64>,
    pub chunk_failures: Counter<u64>,
    pub queue_depth: Gauge<u64>,
    pub queue_depth_max: Gauge<u64>,
    pub spawns_purged: Counter<u64>,
}

impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            rows_written: meter
                .u64_counter("mapkeep_rows_written_total")
                .with_description("Rows inserted or overwritten by the upsert path")
                .with_unit("1")
                .init(),
            upsert_latency: meter
                .f64_histogram("mapkeep_upsert_latency_seconds")
                .with_description("Duration of one upsert call including every chunk")
                .with_unit("s")
                .init(),
            chunk_failures: meter
                .u64_counter("mapkeep_chunk_failures_total")
                .with_description("Failed chunk attempts, by failure class")
                .with_unit("1")
                .init(),
            queue_depth: meter
                .u64_gauge("mapkeep_queue_depth")
                .with_description("Write jobs submitted and not yet completed")
                .with_unit("1")
                .init(),
            queue_depth_max: meter
                .u64_gauge("mapkeep_queue_depth_max")
                .with_description("Highest write queue depth observed")
                .with_unit("1")
                .init(),
            spawns_purged: meter
                .u64_counter("mapkeep_spawns_purged_total")
                .with_description("Spawns deleted by the retention sweeper")
                .with_unit("1")
                .init(),
        }
    }
}

fn manual_provider() -> SdkMeterProvider {
    let reader = ManualReader::builder().build();
    SdkMeterProvider::builder().with_reader(reader).build()
}

/// Initialize the metrics system.
///
/// With an endpoint, metrics are exported over OTLP every 10 seconds;
/// otherwise they are recorded but not exported. Subsequent calls are ignored.
pub fn init_metrics_with_endpoint(otel_endpoint: Option<&str>) {
    METRICS.get_or_init(|| {
        if let Some(endpoint) = otel_endpoint {
            use opentelemetry_otlp::{Protocol, WithExportConfig};

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc);

            match opentelemetry_otlp::new_pipeline()
                .metrics(opentelemetry_sdk::runtime::Tokio)
                .with_exporter(exporter)
                .with_period(std::time::Duration::from_secs(10))
                .build()
            {
                Ok(provider) => {
                    global::set_meter_provider(provider);
                    tracing::info!(endpoint, "OTLP metrics exporter configured");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create OTLP exporter, metrics will not be exported");
                    global::set_meter_provider(manual_provider());
                }
            }
        } else {
            global::set_meter_provider(manual_provider());
        }

        Metrics::new(&global::meter("mapkeep"))
    });
}

/// Initialize the metrics system without OTLP export.
pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

/// The global metrics instance, if initialized.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

fn entity_attrs(kind: EntityKind) -> [KeyValue; 1] {
    [KeyValue::new("entity", kind.as_str())]
}

/// Record a completed upsert call.
pub fn record_upsert(kind: EntityKind, rows: usize, latency_seconds: f64) {
    if let Some(m) = METRICS.get() {
        let attrs = entity_attrs(kind);
        m.rows_written.add(rows as u64, &attrs);
        m.upsert_latency.record(latency_seconds, &attrs);
    }
}

/// Record one failed chunk attempt.
pub fn record_chunk_failure(kind: EntityKind, class: &'static str) {
    if let Some(m) = METRICS.get() {
        let attrs = [
            KeyValue::new("entity", kind.as_str()),
            KeyValue::new("class", class),
        ];
        m.chunk_failures.add(1, &attrs);
    }
}

/// Record the current and maximum write queue depth.
pub fn record_queue_depth(depth: usize, max_depth: usize) {
    if let Some(m) = METRICS.get() {
        m.queue_depth.record(depth as u64, &[]);
        m.queue_depth_max.record(max_depth as u64, &[]);
    }
}

/// Record spawns removed by one retention cycle.
pub fn record_spawns_purged(count: usize) {
    if let Some(m) = METRICS.get() {
        m.spawns_purged.add(count as u64, &[]);
    }
}
