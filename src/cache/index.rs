//! Index Cache
//!
//! Parsed pack indexes and bitmap indexes, cached whole under their own byte
//! budget with the same CLOCK discipline as blocks. Loads are single-flight:
//! concurrent misses on one pack share a single read-and-parse.
//!
//! A pack without a bitmap caches the absence, so the backend is asked once.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use super::flight::{Attach, SingleFlight};
use super::key::{PackIdentity, ShardKey};
use super::stats::{ClaimableCost, LatencyTracker, LoadCost};
use super::table::{ClockTable, TableStats, Weighted};
use crate::error::{Error, Result};
use crate::pack::{PackBitmapIndex, PackIndex};

/// Weight charged for a cached "no bitmap" answer
pub const ABSENT_ENTRY_WEIGHT: u64 = 64;

/// Which index file an entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Pack,
    Bitmap,
}

/// Cache key: one pack, one kind of index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexKey {
    pack: PackIdentity,
    kind: IndexKind,
}

impl IndexKey {
    pub fn new(pack: PackIdentity, kind: IndexKind) -> Self {
        Self { pack, kind }
    }

    pub fn pack(&self) -> &PackIdentity {
        &self.pack
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }
}

impl ShardKey for IndexKey {
    fn shard_index(&self, shard_count: usize) -> usize {
        let salt = match self.kind {
            IndexKind::Pack => 0,
            IndexKind::Bitmap => 1,
        };
        self.pack.shard_index(shard_count) ^ (salt & (shard_count - 1))
    }
}

/// A resident index
#[derive(Debug, Clone)]
pub enum IndexValue {
    Pack(Arc<PackIndex>),
    Bitmap(Option<Arc<PackBitmapIndex>>),
}

impl Weighted for IndexValue {
    fn weight(&self) -> u64 {
        match self {
            IndexValue::Pack(index) => index.weight(),
            IndexValue::Bitmap(Some(bitmap)) => bitmap.weight(),
            IndexValue::Bitmap(None) => ABSENT_ENTRY_WEIGHT,
        }
    }
}

/// Result of an index lookup. `cost` is set only for the one caller that
/// accounts for the load: the first to receive its result.
#[derive(Debug, Clone)]
pub struct Lookup<T> {
    pub value: T,
    pub cost: Option<LoadCost>,
}

#[derive(Clone)]
struct Loaded {
    value: IndexValue,
    cost: ClaimableCost,
}

/// Cache of parsed pack and bitmap indexes
pub struct IndexCache {
    table: Arc<ClockTable<IndexKey, IndexValue>>,
    flight: SingleFlight<IndexKey, Loaded>,
}

impl IndexCache {
    /// Create an index cache with a byte budget
    pub fn new(capacity: u64, shard_count: usize) -> Self {
        Self {
            table: Arc::new(ClockTable::new(capacity, shard_count)),
            flight: SingleFlight::new(),
        }
    }

    /// Parsed index of `pack`. `load` reads the index file and returns the
    /// parsed index plus the number of bytes read; it runs only on a miss.
    pub async fn get_index<F, Fut>(&self, pack: &PackIdentity, load: F) -> Result<Lookup<Arc<PackIndex>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Arc<PackIndex>, u64)>> + Send + 'static,
    {
        let key = IndexKey::new(pack.clone(), IndexKind::Pack);
        let lookup = self
            .lookup(key, move || {
                let fut = load();
                async move {
                    let (index, bytes) = fut.await?;
                    Ok((IndexValue::Pack(index), bytes))
                }
            })
            .await?;
        match lookup.value {
            IndexValue::Pack(index) => Ok(Lookup {
                value: index,
                cost: lookup.cost,
            }),
            IndexValue::Bitmap(_) => Err(Error::Internal(format!(
                "index cache returned a bitmap for the pack index of {}",
                pack
            ))),
        }
    }

    /// Bitmap index of `pack`, `None` if the pack has no bitmap
    pub async fn get_bitmap<F, Fut>(
        &self,
        pack: &PackIdentity,
        load: F,
    ) -> Result<Lookup<Option<Arc<PackBitmapIndex>>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Option<Arc<PackBitmapIndex>>, u64)>> + Send + 'static,
    {
        let key = IndexKey::new(pack.clone(), IndexKind::Bitmap);
        let lookup = self
            .lookup(key, move || {
                let fut = load();
                async move {
                    let (bitmap, bytes) = fut.await?;
                    Ok((IndexValue::Bitmap(bitmap), bytes))
                }
            })
            .await?;
        match lookup.value {
            IndexValue::Bitmap(bitmap) => Ok(Lookup {
                value: bitmap,
                cost: lookup.cost,
            }),
            IndexValue::Pack(_) => Err(Error::Internal(format!(
                "index cache returned a pack index for the bitmap of {}",
                pack
            ))),
        }
    }

    async fn lookup<F, Fut>(&self, key: IndexKey, load: F) -> Result<Lookup<IndexValue>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(IndexValue, u64)>> + Send + 'static,
    {
        if let Some(hit) = self.table.get(&key) {
            return Ok(Lookup {
                value: (*hit).clone(),
                cost: None,
            });
        }

        let table = Arc::clone(&self.table);
        let attach = self.flight.begin(
            key.clone(),
            || {
                self.table.peek(&key).map(|hit| Loaded {
                    value: (*hit).clone(),
                    cost: ClaimableCost::default(),
                })
            },
            || {
                let key = key.clone();
                let work = load();
                async move {
                    let tracker = LatencyTracker::start();
                    let (value, bytes) = work.await?;
                    let cost = LoadCost {
                        bytes,
                        micros: tracker.elapsed_micros(),
                    };
                    debug!(?key, bytes, micros = cost.micros, "loaded index");
                    let resident = table.insert(key, value);
                    Ok(Loaded {
                        value: (*resident).clone(),
                        cost: ClaimableCost::new(cost),
                    })
                }
            },
        );

        match attach {
            Attach::Ready(loaded) => Ok(Lookup {
                value: loaded.value,
                cost: None,
            }),
            Attach::Pending(flight) => {
                let loaded = flight.wait().await?;
                Ok(Lookup {
                    cost: loaded.cost.claim(),
                    value: loaded.value,
                })
            }
        }
    }

    /// Whether an index of `kind` for `pack` is resident
    pub fn contains(&self, pack: &PackIdentity, kind: IndexKind) -> bool {
        self.table.contains(&IndexKey::new(pack.clone(), kind))
    }

    /// Drop both indexes of `pack`. Returns the number of entries removed.
    pub fn invalidate_pack(&self, pack: &PackIdentity) -> usize {
        self.table.invalidate_matching(|k| k.pack() == pack)
    }

    /// Number of index loads in flight
    pub fn loads_in_flight(&self) -> usize {
        self.flight.in_flight()
    }

    /// Get index table statistics
    pub fn stats(&self) -> TableStats {
        self.table.stats()
    }
}

// =============================================================================
// Tests
// =============================================================================
