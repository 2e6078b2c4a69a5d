//! Pack Index (version 2)
//!
//! Maps object ids to pack offsets. The file is kept as one `Bytes` buffer
//! and looked up in place.
//!
//! ```text
//! magic "\377tOc" | version u32 = 2
//! fanout          256 x u32       cumulative object counts by first byte
//! object ids      N x 20 bytes    sorted
//! crc32           N x u32
//! offsets         N x u32         MSB set: index into the 64-bit table
//! large offsets   M x u64
//! trailer         pack checksum (20) | index checksum (20)
//! ```
//!
//! All integers are big-endian.

use std::fmt;

use bytes::Bytes;

use crate::cache::key::PackIdentity;
use crate::cache::table::Weighted;
use crate::error::{Error, Result};

/// Magic bytes at the start of a v2 index
pub const INDEX_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];

/// Length of an object id
pub const OBJECT_ID_LEN: usize = 20;

const FANOUT_ENTRIES: usize = 256;
const HEADER_LEN: usize = 8;
const FANOUT_LEN: usize = FANOUT_ENTRIES * 4;
const TRAILER_LEN: usize = 2 * OBJECT_ID_LEN;
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

/// 20-byte object id
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// Wrap raw id bytes
    pub fn from_bytes(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 40-character hex id
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != OBJECT_ID_LEN * 2 || !hex.is_ascii() {
            return None;
        }
        let mut out = [0u8; OBJECT_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(out))
    }

    /// Raw id bytes
    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    fn from_slice(slice: &[u8]) -> Self {
        let mut out = [0u8; OBJECT_ID_LEN];
        out.copy_from_slice(slice);
        Self(out)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

/// One index entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: ObjectId,
    pub offset: u64,
    pub crc32: u32,
}

/// Parsed, read-only pack index
pub struct PackIndex {
    data: Bytes,
    object_count: usize,
    ids_at: usize,
    crc_at: usize,
    offsets_at: usize,
    large_at: usize,
    large_count: usize,
}

#[inline]
fn be_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

#[inline]
fn be_u64(data: &[u8], at: usize) -> u64 {
    (be_u32(data, at) as u64) << 32 | be_u32(data, at + 4) as u64
}

impl PackIndex {
    /// Parse a v2 index for `pack`
    pub fn parse(pack: &PackIdentity, data: Bytes) -> Result<Self> {
        let corrupt = |reason: String| Error::CorruptIndex {
            pack: pack.to_string(),
            reason,
        };

        if data.len() < HEADER_LEN + FANOUT_LEN + TRAILER_LEN {
            return Err(corrupt(format!("index too short: {} bytes", data.len())));
        }
        if data[..4] != INDEX_MAGIC {
            return Err(corrupt("bad index magic".into()));
        }
        let version = be_u32(&data, 4);
        if version != 2 {
            return Err(corrupt(format!("unsupported index version {}", version)));
        }

        let mut previous = 0;
        for bucket in 0..FANOUT_ENTRIES {
            let count = be_u32(&data, HEADER_LEN + bucket * 4);
            if count < previous {
                return Err(corrupt(format!("fanout decreases at bucket {}", bucket)));
            }
            previous = count;
        }
        let object_count = previous as usize;

        let ids_at = HEADER_LEN + FANOUT_LEN;
        let crc_at = ids_at + object_count * OBJECT_ID_LEN;
        let offsets_at = crc_at + object_count * 4;
        let large_at = offsets_at + object_count * 4;
        if large_at + TRAILER_LEN > data.len() {
            return Err(corrupt(format!(
                "{} objects do not fit {} bytes",
                object_count,
                data.len()
            )));
        }

        let large_bytes = data.len() - TRAILER_LEN - large_at;
        if large_bytes % 8 != 0 {
            return Err(corrupt("large offset table is not 8-byte aligned".into()));
        }
        let large_count = large_bytes / 8;

        let index = Self {
            data,
            object_count,
            ids_at,
            crc_at,
            offsets_at,
            large_at,
            large_count,
        };

        for n in 0..object_count {
            let raw = be_u32(&index.data, offsets_at + n * 4);
            if raw & LARGE_OFFSET_FLAG != 0 && (raw & !LARGE_OFFSET_FLAG) as usize >= large_count {
                return Err(corrupt(format!("entry {} points past the large offset table", n)));
            }
            if n > 0 && index.id_slice(n - 1) >= index.id_slice(n) {
                return Err(corrupt(format!("object ids not sorted at entry {}", n)));
            }
        }

        Ok(index)
    }

    /// Number of objects in the pack
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    /// Number of 64-bit offsets
    pub fn large_offset_count(&self) -> usize {
        self.large_count
    }

    fn id_slice(&self, n: usize) -> &[u8] {
        let at = self.ids_at + n * OBJECT_ID_LEN;
        &self.data[at..at + OBJECT_ID_LEN]
    }

    fn fanout(&self, bucket: usize) -> usize {
        be_u32(&self.data, HEADER_LEN + bucket * 4) as usize
    }

    /// Object id at sorted position `n`
    pub fn object_id(&self, n: usize) -> Option<ObjectId> {
        (n < self.object_count).then(|| ObjectId::from_slice(self.id_slice(n)))
    }

    /// Pack offset of the object at position `n`
    pub fn offset_at(&self, n: usize) -> Option<u64> {
        if n >= self.object_count {
            return None;
        }
        let raw = be_u32(&self.data, self.offsets_at + n * 4);
        if raw & LARGE_OFFSET_FLAG == 0 {
            Some(raw as u64)
        } else {
            let slot = (raw & !LARGE_OFFSET_FLAG) as usize;
            Some(be_u64(&self.data, self.large_at + slot * 8))
        }
    }

    /// CRC32 of the packed object at position `n`
    pub fn crc32_at(&self, n: usize) -> Option<u32> {
        (n < self.object_count).then(|| be_u32(&self.data, self.crc_at + n * 4))
    }

    /// Sorted position of `id`, using the fanout table to narrow the search
    pub fn position(&self, id: &ObjectId) -> Option<usize> {
        let first = id.as_bytes()[0] as usize;
        let lo = if first == 0 { 0 } else { self.fanout(first - 1) };
        let hi = self.fanout(first);

        let (mut lo, mut hi) = (lo, hi);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.id_slice(mid).cmp(&id.as_bytes()[..]) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    /// Pack offset of object `id`
    pub fn find_offset(&self, id: &ObjectId) -> Option<u64> {
        self.position(id).and_then(|n| self.offset_at(n))
    }

    /// Whether the pack contains `id`
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.position(id).is_some()
    }

    /// Checksum of the pack this index describes
    pub fn pack_checksum(&self) -> ObjectId {
        let at = self.data.len() - TRAILER_LEN;
        ObjectId::from_slice(&self.data[at..at + OBJECT_ID_LEN])
    }

    /// Entries in id order
    pub fn entries(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        (0..self.object_count).filter_map(move |n| {
            Some(IndexEntry {
                id: self.object_id(n)?,
                offset: self.offset_at(n)?,
                crc32: self.crc32_at(n)?,
            })
        })
    }

    /// Size of the parsed index in bytes
    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

impl Weighted for PackIndex {
    fn weight(&self) -> u64 {
        self.size_bytes()
    }
}

impl fmt::Debug for PackIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackIndex")
            .field("objects", &self.object_count)
            .field("large_offsets", &self.large_count)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// =============================================================================
// Index Writer
// =============================================================================

/// Serialize a v2 index. Used by tooling and tests that fabricate packs.
pub fn write_index(entries: &[IndexEntry], pack_checksum: &ObjectId) -> Bytes {
    let mut sorted = entries.to_vec();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut out = Vec::with_capacity(HEADER_LEN + FANOUT_LEN + sorted.len() * 28 + TRAILER_LEN);
    out.extend_from_slice(&INDEX_MAGIC);
    out.extend_from_slice(&2u32.to_be_bytes());

    let mut counts = [0u32; FANOUT_ENTRIES];
    for entry in &sorted {
        counts[entry.id.as_bytes()[0] as usize] += 1;
    }
    let mut running = 0u32;
    for count in counts {
        running += count;
        out.extend_from_slice(&running.to_be_bytes());
    }

    for entry in &sorted {
        out.extend_from_slice(entry.id.as_bytes());
    }
    for entry in &sorted {
        out.extend_from_slice(&entry.crc32.to_be_bytes());
    }

    let mut large = Vec::new();
    for entry in &sorted {
        if entry.offset < LARGE_OFFSET_FLAG as u64 {
            out.extend_from_slice(&(entry.offset as u32).to_be_bytes());
        } else {
            out.extend_from_slice(&(LARGE_OFFSET_FLAG | large.len() as u32).to_be_bytes());
            large.push(entry.offset);
        }
    }
    for offset in large {
        out.extend_from_slice(&offset.to_be_bytes());
    }

    out.extend_from_slice(pack_checksum.as_bytes());
    // Index checksum is not verified on read
    out.extend_from_slice(&[0u8; OBJECT_ID_LEN]);
    Bytes::from(out)
}

// =============================================================================
// Tests
// =============================================================================
