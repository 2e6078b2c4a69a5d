//! packcache - Block-Level Read Cache for Immutable Pack Files
//!
//! Serves reads of pack files (and their indexes and bitmap indexes) from
//! a shared in-memory cache placed in front of a slow or remote backend.
//! Many reader sessions share the cache; each keeps its own I/O counters.
//!
//! # Architecture
//!
//! ```text
//! PackReader (session, owns stats) → BlockCache (shared) → PackBackend
//! ```
//!
//! - Blocks live in a sharded, byte-bounded CLOCK table
//! - Concurrent misses on the same key share one backend read
//! - Parsed pack indexes and bitmaps are cached whole in a second table
//! - Compressed records are inflated and verified on the way out
//!
//! # Modules
//!
//! - [`backend`] - Pack storage backends (memory, filesystem, HTTP)
//! - [`cache`] - Tables, load coordination, block and index caches
//! - [`config`] - Cache configuration
//! - [`error`] - Error types
//! - [`monitoring`] - Prometheus exposition of statistics
//! - [`pack`] - Pack index and bitmap index formats
//! - [`reader`] - Reader sessions

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod monitoring;
pub mod pack;
pub mod reader;

// Re-export commonly used types
pub use backend::{FsBackend, HttpBackend, HttpBackendConfig, InMemoryBackend, PackBackend, PackChannel};
pub use cache::{BlockCache, BlockHandle, BlockKey, PackExt, PackIdentity, StatsSnapshot, TableStats};
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use monitoring::StatsExporter;
pub use reader::PackReader;

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// =============================================================================
// Tests
// =============================================================================
