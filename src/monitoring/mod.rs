//! Observability
//!
//! Prometheus exposition of reader statistics and cache table state.

mod exporter;

pub use exporter::StatsExporter;
