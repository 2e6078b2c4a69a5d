//! Reader I/O Statistics
//!
//! Per-session counters. An accumulator belongs to exactly one reader and is
//! mutated through `&mut`, so no atomics are involved; callers who want an
//! aggregate merge snapshots explicitly.

use std::iter::Sum;
use std::ops::Add;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Backend cost of one load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCost {
    /// Bytes read from the backend
    pub bytes: u64,
    /// Wall time of the read, and of the parse for indexes
    pub micros: u64,
}

/// Load cost handed to every waiter of a shared load; exactly one of them
/// takes it, whichever receives the result first. Waiters that went away
/// before the load finished never take it.
#[derive(Debug, Clone, Default)]
pub struct ClaimableCost {
    cost: LoadCost,
    claimed: Arc<AtomicBool>,
}

impl ClaimableCost {
    /// Wrap the cost of a finished load
    pub fn new(cost: LoadCost) -> Self {
        Self {
            cost,
            claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Take the cost. Returns `None` to every caller after the first.
    pub fn claim(&self) -> Option<LoadCost> {
        (!self.claimed.swap(true, Ordering::AcqRel)).then_some(self.cost)
    }
}

/// Mutable counter set owned by one reader session
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    scan_packs: u64,
    index_loads: u64,
    bitmap_loads: u64,
    index_bytes_read: u64,
    index_load_micros: u64,
    block_cache_hits: u64,
    block_loads: u64,
    block_bytes_read: u64,
    block_load_micros: u64,
    decompressed_bytes: u64,
}

impl StatsAccumulator {
    /// Create a zeroed accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// The pack list was rescanned
    pub fn record_scan_packs(&mut self) {
        self.scan_packs += 1;
    }

    /// A complete pack index was read and parsed
    pub fn record_index_load(&mut self, bytes: u64, micros: u64) {
        self.index_loads += 1;
        self.index_bytes_read += bytes;
        self.index_load_micros += micros;
    }

    /// A complete bitmap index was read and parsed (or found absent)
    pub fn record_bitmap_load(&mut self, bytes: u64, micros: u64) {
        self.bitmap_loads += 1;
        self.index_bytes_read += bytes;
        self.index_load_micros += micros;
    }

    /// A block request was served from the cache
    pub fn record_block_hit(&mut self) {
        self.block_cache_hits += 1;
    }

    /// A block was read from the backend
    pub fn record_block_load(&mut self, bytes: u64, micros: u64) {
        self.block_loads += 1;
        self.block_bytes_read += bytes;
        self.block_load_micros += micros;
    }

    /// One decompression call produced `bytes` bytes
    pub fn record_decompressed(&mut self, bytes: u64) {
        self.decompressed_bytes += bytes;
    }

    /// Immutable copy of the current counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            scan_packs: self.scan_packs,
            index_loads: self.index_loads,
            bitmap_loads: self.bitmap_loads,
            index_bytes_read: self.index_bytes_read,
            index_load_micros: self.index_load_micros,
            block_cache_hits: self.block_cache_hits,
            block_loads: self.block_loads,
            block_bytes_read: self.block_bytes_read,
            block_load_micros: self.block_load_micros,
            decompressed_bytes: self.decompressed_bytes,
        }
    }
}

/// Snapshot of one session's I/O statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Times the pack list was rescanned
    pub scan_packs: u64,
    /// Complete pack indexes read into memory
    pub index_loads: u64,
    /// Complete bitmap indexes read into memory
    pub bitmap_loads: u64,
    /// Bytes read from pack and bitmap indexes
    pub index_bytes_read: u64,
    /// Microseconds spent reading pack and bitmap indexes
    pub index_load_micros: u64,
    /// Block requests served from the cache
    pub block_cache_hits: u64,
    /// Blocks read from the backend (cache misses)
    pub block_loads: u64,
    /// Bytes read from the backend for blocks
    pub block_bytes_read: u64,
    /// Microseconds spent reading blocks
    pub block_load_micros: u64,
    /// Bytes produced by decompression
    pub decompressed_bytes: u64,
}

impl StatsSnapshot {
    /// Sum of two snapshots
    pub fn merge(&self, other: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            scan_packs: self.scan_packs + other.scan_packs,
            index_loads: self.index_loads + other.index_loads,
            bitmap_loads: self.bitmap_loads + other.bitmap_loads,
            index_bytes_read: self.index_bytes_read + other.index_bytes_read,
            index_load_micros: self.index_load_micros + other.index_load_micros,
            block_cache_hits: self.block_cache_hits + other.block_cache_hits,
            block_loads: self.block_loads + other.block_loads,
            block_bytes_read: self.block_bytes_read + other.block_bytes_read,
            block_load_micros: self.block_load_micros + other.block_load_micros,
            decompressed_bytes: self.decompressed_bytes + other.decompressed_bytes,
        }
    }

    /// Block hit ratio (0.0 - 1.0)
    pub fn block_hit_ratio(&self) -> f64 {
        let total = self.block_cache_hits + self.block_loads;
        if total == 0 {
            0.0
        } else {
            self.block_cache_hits as f64 / total as f64
        }
    }

    /// Time spent on backend reads of blocks
    pub fn block_load_time(&self) -> Duration {
        Duration::from_micros(self.block_load_micros)
    }

    /// Time spent reading indexes
    pub fn index_load_time(&self) -> Duration {
        Duration::from_micros(self.index_load_micros)
    }
}

impl Add for StatsSnapshot {
    type Output = StatsSnapshot;

    fn add(self, other: StatsSnapshot) -> StatsSnapshot {
        self.merge(&other)
    }
}

impl Sum for StatsSnapshot {
    fn sum<I: Iterator<Item = StatsSnapshot>>(iter: I) -> StatsSnapshot {
        iter.fold(StatsSnapshot::default(), |acc, s| acc + s)
    }
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed whole microseconds
    pub fn elapsed_micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_starts_at_zero() {
        let stats = StatsAccumulator::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_each_event_counted_once() {
        let mut stats = StatsAccumulator::new();
        stats.record_scan_packs();
        stats.record_index_load(1024, 50);
        stats.record_bitmap_load(512, 25);
        stats.record_block_hit();
        stats.record_block_hit();
        stats.record_block_load(4096, 100);
        stats.record_decompressed(300);
        stats.record_decompressed(200);

        let snap = stats.snapshot();
        assert_eq!(snap.scan_packs, 1);
        assert_eq!(snap.index_loads, 1);
        assert_eq!(snap.bitmap_loads, 1);
        assert_eq!(snap.index_bytes_read, 1536);
        assert_eq!(snap.index_load_micros, 75);
        assert_eq!(snap.block_cache_hits, 2);
        assert_eq!(snap.block_loads, 1);
        assert_eq!(snap.block_bytes_read, 4096);
        assert_eq!(snap.block_load_micros, 100);
        assert_eq!(snap.decompressed_bytes, 500);
        assert!((snap.block_hit_ratio() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut stats = StatsAccumulator::new();
        stats.record_block_hit();
        let before = stats.snapshot();
        stats.record_block_hit();
        assert_eq!(before.block_cache_hits, 1);
        assert_eq!(stats.snapshot().block_cache_hits, 2);
    }

    #[test]
    fn test_merge_and_sum() {
        let mut a = StatsAccumulator::new();
        a.record_block_load(4096, 10);
        let mut b = StatsAccumulator::new();
        b.record_block_load(4096, 20);
        b.record_block_hit();

        let merged = a.snapshot().merge(&b.snapshot());
        assert_eq!(merged.block_loads, 2);
        assert_eq!(merged.block_bytes_read, 8192);
        assert_eq!(merged.block_load_time(), Duration::from_micros(30));

        let total: StatsSnapshot = vec![a.snapshot(), b.snapshot(), b.snapshot()]
            .into_iter()
            .sum();
        assert_eq!(total.block_loads, 3);
        assert_eq!(total.block_cache_hits, 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut stats = StatsAccumulator::new();
        stats.record_scan_packs();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["scan_packs"], 1);
        assert_eq!(json["decompressed_bytes"], 0);
    }

    #[test]
    fn test_claimable_cost_taken_once() {
        let cost = LoadCost {
            bytes: 4096,
            micros: 12,
        };
        let shared = ClaimableCost::new(cost);
        let copies = vec![shared.clone(), shared.clone(), shared];

        let taken: Vec<_> = copies.iter().filter_map(ClaimableCost::claim).collect();
        assert_eq!(taken, vec![cost]);
        assert!(copies[0].claim().is_none());
    }

    #[test]
    fn test_latency_tracker() {
        let tracker = LatencyTracker::start();
        std::thread::sleep(Duration::from_millis(10));
        assert!(tracker.elapsed() >= Duration::from_millis(10));
        assert!(tracker.elapsed_micros() >= 10_000);
    }
}
