//! Block Cache - Shared Cache Façade
//!
//! Composes the block table, the load coordinator, the index cache, the
//! backend and its open channels. One `BlockCache` is shared by every
//! reader session; it keeps no per-session state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::block::{Block, BlockHandle};
use super::compression::Inflater;
use super::flight::{Attach, SingleFlight};
use super::index::{IndexCache, Lookup};
use super::key::{BlockKey, PackExt, PackIdentity};
use super::stats::{ClaimableCost, LatencyTracker, LoadCost};
use super::table::{ClockTable, TableStats};
use crate::backend::{read_all, PackBackend, PackChannel};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::pack::{PackBitmapIndex, PackIndex};

/// Where a block came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    /// Resident in the table
    Cache,
    /// Read from the backend; this caller accounts for the read
    Backend,
    /// Waited on a backend read another caller accounts for
    Shared,
}

impl std::fmt::Display for BlockSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockSource::Cache => write!(f, "cache"),
            BlockSource::Backend => write!(f, "backend"),
            BlockSource::Shared => write!(f, "shared load"),
        }
    }
}

/// Block lookup result
#[derive(Debug)]
pub struct BlockFetch {
    /// Pinned block
    pub handle: BlockHandle,
    /// Where the block came from
    pub source: BlockSource,
    /// Backend cost, set when `source` is [`BlockSource::Backend`]
    pub cost: Option<LoadCost>,
}

/// Outcome of a pack-list rescan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackScan {
    /// Packs present now
    pub packs: Vec<PackIdentity>,
    /// Packs not seen by the previous scan
    pub added: Vec<PackIdentity>,
    /// Packs gone since the previous scan
    pub removed: Vec<PackIdentity>,
}

#[derive(Clone)]
struct LoadedBlock {
    handle: BlockHandle,
    cost: ClaimableCost,
}

struct Inner {
    config: CacheConfig,
    blocks: Arc<ClockTable<BlockKey, Block>>,
    loads: SingleFlight<BlockKey, LoadedBlock>,
    indexes: IndexCache,
    backend: Arc<dyn PackBackend>,
    channels: DashMap<(PackIdentity, PackExt), Arc<dyn PackChannel>>,
    known: Mutex<HashMap<String, HashSet<PackIdentity>>>,
    inflater: Inflater,
}

impl Inner {
    /// Open channel for a pack file, opening it on first use
    async fn channel(&self, pack: &PackIdentity, ext: PackExt) -> Result<Option<Arc<dyn PackChannel>>> {
        let slot = (pack.clone(), ext);
        if let Some(channel) = self.channels.get(&slot) {
            return Ok(Some(Arc::clone(channel.value())));
        }
        let opened = self.backend.open(pack, ext).await?;
        if let Some(channel) = &opened {
            debug!(%pack, %ext, size = channel.size(), backend = self.backend.name(), "opened channel");
            self.channels.insert(slot, Arc::clone(channel));
        }
        Ok(opened)
    }

    async fn required_channel(&self, pack: &PackIdentity, ext: PackExt) -> Result<Arc<dyn PackChannel>> {
        self.channel(pack, ext).await?.ok_or_else(|| Error::PackNotFound {
            pack: pack.to_string(),
            ext: ext.to_string(),
        })
    }

    /// Read one block from the backend and install it
    async fn load_block(self: Arc<Self>, key: BlockKey) -> Result<LoadedBlock> {
        let channel = self.required_channel(key.pack(), PackExt::Pack).await?;
        let size = channel.size();
        let start = self.config.block_start(key.block_number());
        if start >= size {
            return Err(Error::OutOfRange {
                pack: key.pack().to_string(),
                offset: start,
                length: self.config.block_size,
                size,
            });
        }
        // Shorter only for the last block of the pack
        let length = self.config.block_size.min(size - start) as u32;

        let tracker = LatencyTracker::start();
        let data = channel.read_range(start, length).await.map_err(|e| {
            error!(?key, start, length, "block read failed: {}", e);
            e
        })?;
        let micros = tracker.elapsed_micros();
        debug!(?key, bytes = length, micros, "loaded block");

        let resident = self.blocks.insert(key.clone(), Block::new(key, start, data));
        Ok(LoadedBlock {
            handle: BlockHandle::new(resident),
            cost: ClaimableCost::new(LoadCost {
                bytes: length as u64,
                micros,
            }),
        })
    }
}

/// Shared block and index cache in front of a pack backend
#[derive(Clone)]
pub struct BlockCache {
    inner: Arc<Inner>,
}

impl BlockCache {
    /// Create a cache over `backend`
    pub fn new(config: CacheConfig, backend: Arc<dyn PackBackend>) -> Result<Self> {
        config.validate()?;
        info!(
            block_size = config.block_size,
            capacity = config.cache_capacity_bytes,
            index_capacity = config.index_cache_capacity_bytes,
            shards = config.concurrency_shard_count,
            backend = backend.name(),
            "block cache created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                blocks: Arc::new(ClockTable::new(
                    config.cache_capacity_bytes,
                    config.concurrency_shard_count,
                )),
                loads: SingleFlight::new(),
                indexes: IndexCache::new(
                    config.index_cache_capacity_bytes,
                    config.concurrency_shard_count,
                ),
                backend,
                channels: DashMap::new(),
                known: Mutex::new(HashMap::new()),
                inflater: Inflater::new(),
                config,
            }),
        })
    }

    /// Cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Record decoder shared by all sessions
    pub fn inflater(&self) -> &Inflater {
        &self.inner.inflater
    }

    /// Size of a pack's data file
    pub async fn pack_size(&self, pack: &PackIdentity) -> Result<u64> {
        Ok(self.inner.required_channel(pack, PackExt::Pack).await?.size())
    }

    /// Block `key`, loading it on a miss. Concurrent misses on one key
    /// share a single backend read.
    pub async fn block(&self, key: &BlockKey) -> Result<BlockFetch> {
        if let Some(hit) = self.inner.blocks.get(key) {
            return Ok(BlockFetch {
                handle: BlockHandle::new(hit),
                source: BlockSource::Cache,
                cost: None,
            });
        }

        let attach = self.inner.loads.begin(
            key.clone(),
            || {
                self.inner.blocks.peek(key).map(|hit| LoadedBlock {
                    handle: BlockHandle::new(hit),
                    cost: ClaimableCost::default(),
                })
            },
            || Arc::clone(&self.inner).load_block(key.clone()),
        );

        match attach {
            Attach::Ready(loaded) => Ok(BlockFetch {
                handle: loaded.handle,
                source: BlockSource::Cache,
                cost: None,
            }),
            Attach::Pending(flight) => {
                // The first caller to receive the block accounts for the read
                let loaded = flight.wait().await?;
                Ok(match loaded.cost.claim() {
                    Some(cost) => BlockFetch {
                        handle: loaded.handle,
                        source: BlockSource::Backend,
                        cost: Some(cost),
                    },
                    None => BlockFetch {
                        handle: loaded.handle,
                        source: BlockSource::Shared,
                        cost: None,
                    },
                })
            }
        }
    }

    /// Parsed pack index of `pack`
    pub async fn index(&self, pack: &PackIdentity) -> Result<Lookup<Arc<PackIndex>>> {
        let inner = Arc::clone(&self.inner);
        let target = pack.clone();
        self.inner
            .indexes
            .get_index(pack, move || async move {
                let channel = inner.required_channel(&target, PackExt::Index).await?;
                let data = read_all(channel.as_ref()).await?;
                let bytes = data.len() as u64;
                let index = PackIndex::parse(&target, data)?;
                Ok((Arc::new(index), bytes))
            })
            .await
    }

    /// Parsed bitmap index of `pack`, `None` if it has none
    pub async fn bitmap(&self, pack: &PackIdentity) -> Result<Lookup<Option<Arc<PackBitmapIndex>>>> {
        let inner = Arc::clone(&self.inner);
        let target = pack.clone();
        self.inner
            .indexes
            .get_bitmap(pack, move || async move {
                let Some(channel) = inner.channel(&target, PackExt::Bitmap).await? else {
                    debug!(pack = %target, "pack has no bitmap");
                    return Ok((None, 0));
                };
                let data = read_all(channel.as_ref()).await?;
                let bytes = data.len() as u64;
                let bitmap = PackBitmapIndex::parse(&target, data)?;
                Ok((Some(Arc::new(bitmap)), bytes))
            })
            .await
    }

    /// List the packs of `store_id` and forget packs that disappeared:
    /// their unpinned blocks, cached indexes and open channels are dropped.
    pub async fn scan_packs(&self, store_id: &str) -> Result<PackScan> {
        let listed = self.inner.backend.list_packs(store_id).await?;
        let current: HashSet<PackIdentity> = listed.iter().cloned().collect();

        let (added, removed) = {
            let mut known = self.inner.known.lock();
            let previous = known.insert(store_id.to_string(), current.clone());
            match previous {
                Some(previous) => (
                    listed.iter().filter(|p| !previous.contains(*p)).cloned().collect::<Vec<_>>(),
                    previous.difference(&current).cloned().collect::<Vec<_>>(),
                ),
                None => (listed.clone(), Vec::new()),
            }
        };

        for pack in &removed {
            self.forget_pack(pack);
        }
        if !removed.is_empty() || !added.is_empty() {
            info!(
                store = store_id,
                packs = listed.len(),
                added = added.len(),
                removed = removed.len(),
                "pack list changed"
            );
        }

        Ok(PackScan {
            packs: listed,
            added,
            removed,
        })
    }

    /// Drop everything cached for `pack` that is not pinned
    pub fn forget_pack(&self, pack: &PackIdentity) {
        let blocks = self.inner.blocks.invalidate_matching(|k| k.pack() == pack);
        let indexes = self.inner.indexes.invalidate_pack(pack);
        self.inner.channels.retain(|(p, _), _| p != pack);
        debug!(%pack, blocks, indexes, "forgot pack");
    }

    /// Remove an unpinned block. Returns `false` if it is pinned or absent.
    pub fn invalidate_block(&self, key: &BlockKey) -> bool {
        let removed = self.inner.blocks.invalidate(key);
        debug!(?key, removed, "invalidate block");
        removed
    }

    /// Whether block `key` is resident
    pub fn contains_block(&self, key: &BlockKey) -> bool {
        self.inner.blocks.contains(key)
    }

    /// Bytes of resident blocks
    pub fn resident_bytes(&self) -> u64 {
        self.inner.blocks.resident_bytes()
    }

    /// Block loads in flight
    pub fn loads_in_flight(&self) -> usize {
        self.inner.loads.in_flight()
    }

    /// Block table statistics
    pub fn table_stats(&self) -> TableStats {
        self.inner.blocks.stats()
    }

    /// Index table statistics
    pub fn index_stats(&self) -> TableStats {
        self.inner.indexes.stats()
    }
}

// =============================================================================
// Tests
// =============================================================================
