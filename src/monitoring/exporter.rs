//! Prometheus Exporter
//!
//! Session counters are added when a session finishes; table gauges are
//! refreshed on demand. The exporter owns its registry so several caches in
//! one process do not collide.

use prometheus::{Encoder, GaugeVec, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::stats::StatsSnapshot;
use crate::cache::table::TableStats;
use crate::error::{Error, Result};

const NAMESPACE: &str = "packcache";

fn registration(err: prometheus::Error) -> Error {
    Error::Internal(format!("metric registration failed: {}", err))
}

/// Counters mirroring [`StatsSnapshot`], summed over finished sessions
struct SessionCounters {
    sessions: IntCounter,
    scan_packs: IntCounter,
    index_loads: IntCounter,
    bitmap_loads: IntCounter,
    index_bytes_read: IntCounter,
    index_load_micros: IntCounter,
    block_cache_hits: IntCounter,
    block_loads: IntCounter,
    block_bytes_read: IntCounter,
    block_load_micros: IntCounter,
    decompressed_bytes: IntCounter,
}

impl SessionCounters {
    fn register(registry: &Registry) -> Result<Self> {
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
                .map_err(registration)?;
            registry.register(Box::new(c.clone())).map_err(registration)?;
            Ok(c)
        };

        Ok(Self {
            sessions: counter("reader_sessions_total", "Reader sessions recorded")?,
            scan_packs: counter("scan_packs_total", "Pack list rescans")?,
            index_loads: counter("index_loads_total", "Pack indexes read into memory")?,
            bitmap_loads: counter("bitmap_loads_total", "Bitmap indexes read into memory")?,
            index_bytes_read: counter("index_read_bytes_total", "Bytes read for indexes")?,
            index_load_micros: counter(
                "index_load_microseconds_total",
                "Time spent reading indexes",
            )?,
            block_cache_hits: counter("block_cache_hits_total", "Block requests served from cache")?,
            block_loads: counter("block_loads_total", "Blocks read from the backend")?,
            block_bytes_read: counter("block_read_bytes_total", "Bytes read for blocks")?,
            block_load_micros: counter(
                "block_load_microseconds_total",
                "Time spent reading blocks",
            )?,
            decompressed_bytes: counter(
                "decompressed_bytes_total",
                "Bytes produced by decompression",
            )?,
        })
    }
}

/// Gauges describing one cache table, labelled by table name
struct TableGauges {
    capacity: IntGaugeVec,
    resident: IntGaugeVec,
    entries: IntGaugeVec,
    hits: IntGaugeVec,
    misses: IntGaugeVec,
    evictions: IntGaugeVec,
    overflows: IntGaugeVec,
    hit_ratio: GaugeVec,
}

impl TableGauges {
    fn register(registry: &Registry) -> Result<Self> {
        let int_gauge = |name: &str, help: &str| -> Result<IntGaugeVec> {
            let g = IntGaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), &["table"])
                .map_err(registration)?;
            registry.register(Box::new(g.clone())).map_err(registration)?;
            Ok(g)
        };
        let hit_ratio = GaugeVec::new(
            Opts::new("table_hit_ratio", "Table hit ratio").namespace(NAMESPACE),
            &["table"],
        )
        .map_err(registration)?;
        registry
            .register(Box::new(hit_ratio.clone()))
            .map_err(registration)?;

        Ok(Self {
            capacity: int_gauge("table_capacity_bytes", "Table byte budget")?,
            resident: int_gauge("table_resident_bytes", "Bytes resident in the table")?,
            entries: int_gauge("table_entries", "Values resident in the table")?,
            hits: int_gauge("table_hits", "Table lookups that hit")?,
            misses: int_gauge("table_misses", "Table lookups that missed")?,
            evictions: int_gauge("table_evictions", "Values evicted by sweeps")?,
            overflows: int_gauge(
                "table_capacity_overflows",
                "Sweeps that left the table above budget because everything was pinned",
            )?,
            hit_ratio,
        })
    }
}

/// Prometheus exporter for reader statistics and table state
pub struct StatsExporter {
    registry: Registry,
    sessions: SessionCounters,
    tables: TableGauges,
}

impl StatsExporter {
    /// Create an exporter with a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let sessions = SessionCounters::register(&registry)?;
        let tables = TableGauges::register(&registry)?;
        Ok(Self {
            registry,
            sessions,
            tables,
        })
    }

    /// Add a finished session's counters
    pub fn record_session(&self, stats: &StatsSnapshot) {
        let s = &self.sessions;
        s.sessions.inc();
        s.scan_packs.inc_by(stats.scan_packs);
        s.index_loads.inc_by(stats.index_loads);
        s.bitmap_loads.inc_by(stats.bitmap_loads);
        s.index_bytes_read.inc_by(stats.index_bytes_read);
        s.index_load_micros.inc_by(stats.index_load_micros);
        s.block_cache_hits.inc_by(stats.block_cache_hits);
        s.block_loads.inc_by(stats.block_loads);
        s.block_bytes_read.inc_by(stats.block_bytes_read);
        s.block_load_micros.inc_by(stats.block_load_micros);
        s.decompressed_bytes.inc_by(stats.decompressed_bytes);
    }

    /// Refresh the gauges of table `table` ("block" or "index")
    pub fn observe_table(&self, table: &str, stats: &TableStats) {
        let t = &self.tables;
        let labels = &[table];
        t.capacity.with_label_values(labels).set(stats.capacity as i64);
        t.resident.with_label_values(labels).set(stats.resident_bytes as i64);
        t.entries.with_label_values(labels).set(stats.entries as i64);
        t.hits.with_label_values(labels).set(stats.hits as i64);
        t.misses.with_label_values(labels).set(stats.misses as i64);
        t.evictions.with_label_values(labels).set(stats.evictions as i64);
        t.overflows.with_label_values(labels).set(stats.overflows as i64);
        t.hit_ratio.with_label_values(labels).set(stats.hit_ratio);
    }

    /// Registry holding every metric
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metric encoding failed: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metric encoding failed: {}", e)))
    }
}

// =============================================================================
// Tests
// =============================================================================
