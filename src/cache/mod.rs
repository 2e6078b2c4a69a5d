//! Block-Level Read Cache
//!
//! Caches fixed-size blocks of immutable pack files, and whole parsed
//! indexes, in front of a possibly remote backend.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                     PackReader (one per session)                          │
//! │                     StatsAccumulator (owned, &mut)                        │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                     BlockCache (shared, Clone)                            │
//! │  ┌──────────────────────┐ ┌───────────────────┐ ┌──────────────────────┐ │
//! │  │ ClockTable           │ │ SingleFlight      │ │ IndexCache           │ │
//! │  │ BlockKey → Block     │ │ one load per key  │ │ ClockTable of parsed │ │
//! │  │ N-way sharded CLOCK  │ │ shared futures    │ │ indexes and bitmaps  │ │
//! │  └──────────────────────┘ └───────────────────┘ └──────────────────────┘ │
//! │             │                       │                      │              │
//! │             └───────────────────────┴──────────────────────┘              │
//! │                                     │                                     │
//! │                    PackBackend → PackChannel (open, cached)               │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - No global lock: tables are sharded by key hash, loads coordinate per key
//! - Handles pin what they point at; a pinned value is never evicted
//! - Loads run as their own tasks and finish even if every waiter leaves
//! - Counters are per session and counted once per event

pub mod block;
pub mod compression;
pub mod flight;
pub mod index;
pub mod key;
pub mod manager;
pub mod stats;
pub mod table;

mod proptest;
mod shard;

pub use block::{Block, BlockHandle};
pub use compression::{CompressionAlgorithm, Compressor, Inflater, RecordHeader};
pub use flight::{Attach, Role, SingleFlight};
pub use index::{IndexCache, IndexKind, Lookup};
pub use key::{BlockKey, PackExt, PackIdentity, ShardKey};
pub use manager::{BlockCache, BlockFetch, BlockSource, PackScan};
pub use stats::{ClaimableCost, LatencyTracker, LoadCost, StatsAccumulator, StatsSnapshot};
pub use table::{ClockTable, Pinned, TableStats, Weighted};

// =============================================================================
// Tests
// =============================================================================
