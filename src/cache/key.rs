//! Cache Key Types
//!
//! Pack identities and block keys. Hashes are computed once at construction
//! so shard selection and map lookups never rehash the pack name.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
pub(crate) fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Identity of one immutable pack: the store it lives in and its name
#[derive(Clone, Eq)]
pub struct PackIdentity {
    /// Pre-computed hash of (store, name)
    hash: u64,
    store_id: Arc<str>,
    pack_name: Arc<str>,
}

impl PackIdentity {
    /// Create a new pack identity
    pub fn new(store_id: impl AsRef<str>, pack_name: impl AsRef<str>) -> Self {
        let store_id: Arc<str> = Arc::from(store_id.as_ref());
        let pack_name: Arc<str> = Arc::from(pack_name.as_ref());
        let hash = fx_hash(store_id.as_bytes()).rotate_left(17) ^ fx_hash(pack_name.as_bytes());
        Self {
            hash,
            store_id,
            pack_name,
        }
    }

    /// Store (repository) identifier
    #[inline]
    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Pack name, without extension
    #[inline]
    pub fn pack_name(&self) -> &str {
        &self.pack_name
    }

    /// Pre-computed hash
    #[inline]
    pub fn combined_hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for PackIdentity {
    fn eq(&self, other: &Self) -> bool {
        // Fast path: compare hashes first
        self.hash == other.hash
            && self.store_id == other.store_id
            && self.pack_name == other.pack_name
    }
}

impl Hash for PackIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for PackIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.store_id, self.pack_name)
    }
}

impl fmt::Debug for PackIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackIdentity({})", self)
    }
}

/// File extensions that make up one pack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackExt {
    /// Object data
    Pack,
    /// Object id to offset index
    Index,
    /// Reachability bitmaps
    Bitmap,
}

impl PackExt {
    /// File extension without the dot
    pub fn extension(&self) -> &'static str {
        match self {
            PackExt::Pack => "pack",
            PackExt::Index => "idx",
            PackExt::Bitmap => "bitmap",
        }
    }

    /// File name for a pack with this extension
    pub fn file_name(&self, pack: &PackIdentity) -> String {
        format!("{}.{}", pack.pack_name(), self.extension())
    }
}

impl fmt::Display for PackExt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Key of one cached block: the pack and the block number within it
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pack: PackIdentity,
    block: u64,
}

impl BlockKey {
    /// Create a key for block number `block` of `pack`
    pub fn new(pack: PackIdentity, block: u64) -> Self {
        Self { pack, block }
    }

    /// Key of the block containing `offset`
    pub fn for_offset(pack: PackIdentity, offset: u64, block_size: u64) -> Self {
        Self::new(pack, offset / block_size)
    }

    /// Owning pack
    #[inline]
    pub fn pack(&self) -> &PackIdentity {
        &self.pack
    }

    /// Block number within the pack
    #[inline]
    pub fn block_number(&self) -> u64 {
        self.block
    }
}

impl fmt::Debug for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockKey({}#{})", self.pack, self.block)
    }
}

/// Keys that can be routed to a lock shard
pub trait ShardKey {
    /// Shard for this key; `shard_count` must be a power of two
    fn shard_index(&self, shard_count: usize) -> usize;
}

impl ShardKey for PackIdentity {
    #[inline]
    fn shard_index(&self, shard_count: usize) -> usize {
        (self.hash as usize) & (shard_count - 1)
    }
}

impl ShardKey for BlockKey {
    #[inline]
    fn shard_index(&self, shard_count: usize) -> usize {
        // Consecutive blocks of one pack land in different shards
        let mixed = self
            .pack
            .hash
            .wrapping_add(self.block.wrapping_mul(0x9E3779B97F4A7C15));
        ((mixed ^ (mixed >> 29)) as usize) & (shard_count - 1)
    }
}

// =============================================================================
// Tests
// =============================================================================
