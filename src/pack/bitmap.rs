//! Pack Bitmap Index (version 1)
//!
//! Reachability bitmaps stored next to a pack. Bitmaps are EWAH-compressed
//! and may be XOR-ed against an earlier entry to save space.
//!
//! ```text
//! magic "BITM" | version u16 = 1 | flags u16 | entry count u32 | checksum (20)
//! type bitmaps  commits, trees, blobs, tags    (4 x EWAH)
//! entries       position u32 | xor offset u8 | flags u8 | EWAH
//! name hashes   object count x u32             (flag 0x4 only)
//! trailer       checksum (20)
//!
//! EWAH          bit count u32 | word count u32 | words u64... | rlw position u32
//! ```
//!
//! All integers are big-endian.

use std::fmt;

use bytes::Bytes;

use crate::cache::key::PackIdentity;
use crate::cache::table::Weighted;
use crate::error::{Error, Result};

/// Magic bytes at the start of a bitmap index
pub const BITMAP_MAGIC: [u8; 4] = *b"BITM";

/// Bitmaps cover the full closure of every commit
pub const FLAG_FULL_DAG: u16 = 0x1;
/// Name-hash cache follows the entries
pub const FLAG_HASH_CACHE: u16 = 0x4;

const CHECKSUM_LEN: usize = 20;
const HEADER_LEN: usize = 4 + 2 + 2 + 4 + CHECKSUM_LEN;
const MAX_XOR_OFFSET: usize = 160;

// =============================================================================
// EWAH Bitmap
// =============================================================================

/// Run-length compressed bitmap (EWAH, 64-bit words)
#[derive(Clone, PartialEq, Eq)]
pub struct EwahBitmap {
    bit_size: u32,
    words: Vec<u64>,
}

impl EwahBitmap {
    /// Compress a plain bitmap of `bit_size` bits
    pub fn from_words(bit_size: u32, plain: &[u64]) -> Self {
        let mut words = Vec::new();
        let mut i = 0;
        while i < plain.len() {
            let fill = plain[i];
            let mut run = 0usize;
            if fill == 0 || fill == u64::MAX {
                while i + run < plain.len() && plain[i + run] == fill && run < u32::MAX as usize {
                    run += 1;
                }
            }
            let literals_from = i + run;
            let mut literals = 0usize;
            while literals_from + literals < plain.len()
                && plain[literals_from + literals] != 0
                && plain[literals_from + literals] != u64::MAX
                && literals < (1 << 31) - 1
            {
                literals += 1;
            }

            let running_bit = u64::from(run > 0 && fill == u64::MAX);
            words.push(running_bit | (run as u64) << 1 | (literals as u64) << 33);
            words.extend_from_slice(&plain[literals_from..literals_from + literals]);
            i = literals_from + literals;
        }
        Self { bit_size, words }
    }

    /// Number of bits the bitmap covers
    pub fn bit_size(&self) -> u32 {
        self.bit_size
    }

    /// Compressed size in 64-bit words
    pub fn compressed_words(&self) -> usize {
        self.words.len()
    }

    /// Marker words in order, as (fill bit, run length in words, literal words)
    fn runs(&self) -> impl Iterator<Item = (bool, usize, &[u64])> + '_ {
        let mut at = 0;
        std::iter::from_fn(move || {
            let marker = *self.words.get(at)?;
            let run = ((marker >> 1) & 0xffff_ffff) as usize;
            let literals = (marker >> 33) as usize;
            let end = (at + 1 + literals).min(self.words.len());
            let literal_words = &self.words[at + 1..end];
            at = end;
            Some((marker & 1 == 1, run, literal_words))
        })
    }

    /// Expand to plain 64-bit words
    pub fn to_words(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity((self.bit_size as usize + 63) / 64);
        for (fill, run, literals) in self.runs() {
            let fill = if fill { u64::MAX } else { 0 };
            out.extend(std::iter::repeat(fill).take(run));
            out.extend_from_slice(literals);
        }
        out
    }

    /// Whether bit `pos` is set
    pub fn contains(&self, pos: u32) -> bool {
        if pos >= self.bit_size {
            return false;
        }
        let target = pos as usize / 64;
        let mut word = 0usize;
        for (fill, run, literals) in self.runs() {
            if target < word + run {
                return fill;
            }
            word += run;
            if let Some(w) = literals.get(target - word) {
                return w & (1 << (pos % 64)) != 0;
            }
            word += literals.len();
        }
        false
    }

    /// Number of set bits
    pub fn cardinality(&self) -> u64 {
        self.to_words().iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Positions of set bits, ascending
    pub fn ones(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (n, word) in self.to_words().into_iter().enumerate() {
            let mut w = word;
            while w != 0 {
                let bit = w.trailing_zeros();
                let pos = n as u32 * 64 + bit;
                if pos < self.bit_size {
                    out.push(pos);
                }
                w &= w - 1;
            }
        }
        out
    }

    /// Bitwise XOR of two bitmaps
    pub fn xor(&self, other: &EwahBitmap) -> EwahBitmap {
        let a = self.to_words();
        let b = other.to_words();
        let len = a.len().max(b.len());
        let plain: Vec<u64> = (0..len)
            .map(|n| a.get(n).copied().unwrap_or(0) ^ b.get(n).copied().unwrap_or(0))
            .collect();
        EwahBitmap::from_words(self.bit_size.max(other.bit_size), &plain)
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.bit_size.to_be_bytes());
        out.extend_from_slice(&(self.words.len() as u32).to_be_bytes());
        let mut last_marker = 0u32;
        let mut at = 0;
        while at < self.words.len() {
            last_marker = at as u32;
            at += 1 + (self.words[at] >> 33) as usize;
        }
        for word in &self.words {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out.extend_from_slice(&last_marker.to_be_bytes());
    }
}

impl fmt::Debug for EwahBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EwahBitmap")
            .field("bits", &self.bit_size)
            .field("words", &self.words.len())
            .finish()
    }
}

// =============================================================================
// Parser
// =============================================================================

struct Cursor<'a> {
    data: &'a [u8],
    at: usize,
    pack: &'a PackIdentity,
}

impl<'a> Cursor<'a> {
    fn corrupt(&self, reason: impl Into<String>) -> Error {
        Error::CorruptIndex {
            pack: self.pack.to_string(),
            reason: reason.into(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.at < n {
            return Err(self.corrupt(format!("bitmap truncated at byte {}", self.at)));
        }
        let slice = &self.data[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn ewah(&mut self) -> Result<EwahBitmap> {
        let bit_size = self.u32()?;
        let word_count = self.u32()? as usize;
        let byte_len = word_count
            .checked_mul(8)
            .ok_or_else(|| self.corrupt("word count overflow"))?;
        let raw = self.take(byte_len)?;
        let words: Vec<u64> = raw
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        let rlw = self.u32()? as usize;
        if word_count > 0 && rlw >= word_count {
            return Err(self.corrupt("EWAH marker position out of range"));
        }

        // Runs and literals together may not describe more words than bit_size needs
        let limit = (bit_size as u64 + 63) / 64;
        let mut covered = 0u64;
        let mut at = 0;
        while at < word_count {
            let marker = words[at];
            let run = (marker >> 1) & 0xffff_ffff;
            let literals = marker >> 33;
            if literals > (word_count - at - 1) as u64 {
                return Err(self.corrupt(format!("EWAH marker at word {} overruns the bitmap", at)));
            }
            covered += run + literals;
            if covered > limit {
                return Err(self.corrupt(format!(
                    "EWAH runs cover {} words but bitmap has {} bits",
                    covered, bit_size
                )));
            }
            at += 1 + literals as usize;
        }
        Ok(EwahBitmap { bit_size, words })
    }
}

/// One stored commit bitmap
#[derive(Debug, Clone)]
pub struct BitmapEntry {
    /// Position of the commit in the pack index
    pub position: u32,
    /// Distance back to the entry this one is XOR-ed with (0 = none)
    pub xor_offset: u8,
    pub flags: u8,
    pub bitmap: EwahBitmap,
}

/// Parsed, read-only bitmap index
pub struct PackBitmapIndex {
    flags: u16,
    checksum: [u8; CHECKSUM_LEN],
    commits: EwahBitmap,
    trees: EwahBitmap,
    blobs: EwahBitmap,
    tags: EwahBitmap,
    entries: Vec<BitmapEntry>,
    name_hashes: Vec<u32>,
    size: u64,
}

impl PackBitmapIndex {
    /// Parse a v1 bitmap index for `pack`
    pub fn parse(pack: &PackIdentity, data: Bytes) -> Result<Self> {
        let mut cur = Cursor {
            data: &data,
            at: 0,
            pack,
        };

        if cur.take(4)? != BITMAP_MAGIC {
            return Err(cur.corrupt("bad bitmap magic"));
        }
        let version = cur.u16()?;
        if version != 1 {
            return Err(cur.corrupt(format!("unsupported bitmap version {}", version)));
        }
        let flags = cur.u16()?;
        if flags & !(FLAG_FULL_DAG | FLAG_HASH_CACHE) != 0 {
            return Err(cur.corrupt(format!("unsupported bitmap flags {:#x}", flags)));
        }
        let entry_count = cur.u32()? as usize;
        let mut checksum = [0u8; CHECKSUM_LEN];
        checksum.copy_from_slice(cur.take(CHECKSUM_LEN)?);

        let commits = cur.ewah()?;
        let trees = cur.ewah()?;
        let blobs = cur.ewah()?;
        let tags = cur.ewah()?;

        let mut entries = Vec::with_capacity(entry_count.min(data.len() / 6));
        for n in 0..entry_count {
            let position = cur.u32()?;
            let xor_offset = cur.u8()?;
            let entry_flags = cur.u8()?;
            if xor_offset as usize > n || xor_offset as usize > MAX_XOR_OFFSET {
                return Err(cur.corrupt(format!("entry {} has bad xor offset {}", n, xor_offset)));
            }
            entries.push(BitmapEntry {
                position,
                xor_offset,
                flags: entry_flags,
                bitmap: cur.ewah()?,
            });
        }

        let remaining = data.len() - cur.at;
        if remaining < CHECKSUM_LEN {
            return Err(cur.corrupt("bitmap trailer missing"));
        }
        let mut name_hashes = Vec::new();
        if flags & FLAG_HASH_CACHE != 0 {
            let hash_bytes = remaining - CHECKSUM_LEN;
            if hash_bytes % 4 != 0 {
                return Err(cur.corrupt("name-hash cache is not 4-byte aligned"));
            }
            for _ in 0..hash_bytes / 4 {
                name_hashes.push(cur.u32()?);
            }
        } else if remaining != CHECKSUM_LEN {
            return Err(cur.corrupt(format!("{} unexpected trailing bytes", remaining - CHECKSUM_LEN)));
        }

        Ok(Self {
            flags,
            checksum,
            commits,
            trees,
            blobs,
            tags,
            entries,
            name_hashes,
            size: data.len() as u64,
        })
    }

    /// Header flags
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Checksum of the pack the bitmaps describe
    pub fn pack_checksum(&self) -> &[u8; CHECKSUM_LEN] {
        &self.checksum
    }

    /// Number of commits with a stored bitmap
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Stored entries in file order
    pub fn entries(&self) -> &[BitmapEntry] {
        &self.entries
    }

    pub fn commits(&self) -> &EwahBitmap {
        &self.commits
    }

    pub fn trees(&self) -> &EwahBitmap {
        &self.trees
    }

    pub fn blobs(&self) -> &EwahBitmap {
        &self.blobs
    }

    pub fn tags(&self) -> &EwahBitmap {
        &self.tags
    }

    /// Name hashes by index position; empty without the hash cache
    pub fn name_hashes(&self) -> &[u32] {
        &self.name_hashes
    }

    /// Reachability bitmap of the commit at index `position`, with XOR
    /// chains resolved
    pub fn bitmap_for(&self, position: u32) -> Option<EwahBitmap> {
        let mut n = self.entries.iter().position(|e| e.position == position)?;
        let mut resolved = self.entries[n].bitmap.clone();
        while self.entries[n].xor_offset != 0 {
            n -= self.entries[n].xor_offset as usize;
            resolved = resolved.xor(&self.entries[n].bitmap);
        }
        Some(resolved)
    }

    /// Size of the file the index was parsed from
    pub fn size_bytes(&self) -> u64 {
        self.size
    }
}

impl Weighted for PackBitmapIndex {
    fn weight(&self) -> u64 {
        self.size
    }
}

impl fmt::Debug for PackBitmapIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackBitmapIndex")
            .field("flags", &self.flags)
            .field("entries", &self.entries.len())
            .field("bytes", &self.size)
            .finish()
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Type bitmaps of a bitmap index
pub struct TypeBitmaps<'a> {
    pub commits: &'a EwahBitmap,
    pub trees: &'a EwahBitmap,
    pub blobs: &'a EwahBitmap,
    pub tags: &'a EwahBitmap,
}

/// Serialize a v1 bitmap index
pub fn write_bitmap_index(
    types: TypeBitmaps<'_>,
    entries: &[BitmapEntry],
    name_hashes: Option<&[u32]>,
    pack_checksum: &[u8; CHECKSUM_LEN],
) -> Bytes {
    let mut out = Vec::new();
    out.extend_from_slice(&BITMAP_MAGIC);
    out.extend_from_slice(&1u16.to_be_bytes());
    let flags = FLAG_FULL_DAG | if name_hashes.is_some() { FLAG_HASH_CACHE } else { 0 };
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    out.extend_from_slice(pack_checksum);

    for bitmap in [types.commits, types.trees, types.blobs, types.tags] {
        bitmap.write(&mut out);
    }
    for entry in entries {
        out.extend_from_slice(&entry.position.to_be_bytes());
        out.push(entry.xor_offset);
        out.push(entry.flags);
        entry.bitmap.write(&mut out);
    }
    for hash in name_hashes.unwrap_or(&[]) {
        out.extend_from_slice(&hash.to_be_bytes());
    }
    out.extend_from_slice(&[0u8; CHECKSUM_LEN]);
    debug_assert!(out.len() >= HEADER_LEN);
    Bytes::from(out)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn pack() -> PackIdentity {
        PackIdentity::new("repo", "pack-1")
    }

    fn bits(size: u32, set: &[u32]) -> EwahBitmap {
        let mut words = vec![0u64; (size as usize + 63) / 64];
        for &b in set {
            words[b as usize / 64] |= 1 << (b % 64);
        }
        EwahBitmap::from_words(size, &words)
    }

    fn sample(name_hashes: Option<&[u32]>) -> Bytes {
        let commits = bits(200, &[0, 1]);
        let trees = bits(200, &[2, 3, 130]);
        let blobs = bits(200, &[4]);
        let tags = bits(200, &[]);
        let entries = vec![
            BitmapEntry {
                position: 0,
                xor_offset: 0,
                flags: 0,
                bitmap: bits(200, &[0, 2, 4]),
            },
            BitmapEntry {
                position: 1,
                xor_offset: 1,
                flags: 0,
                // XOR against entry 0: resolves to {0, 1, 2, 3, 4, 130}
                bitmap: bits(200, &[1, 3, 130]),
            },
        ];
        write_bitmap_index(
            TypeBitmaps {
                commits: &commits,
                trees: &trees,
                blobs: &blobs,
                tags: &tags,
            },
            &entries,
            name_hashes,
            &[7u8; CHECKSUM_LEN],
        )
    }

    #[test]
    fn test_ewah_compresses_runs() {
        let mut plain = vec![0u64; 100];
        plain[50] = 0b1010;
        plain.extend(std::iter::repeat(u64::MAX).take(20));
        let ewah = EwahBitmap::from_words(120 * 64, &plain);

        assert!(ewah.compressed_words() < 10);
        assert_eq!(ewah.to_words(), plain);
        assert!(ewah.contains(50 * 64 + 1));
        assert!(!ewah.contains(50 * 64));
        assert!(ewah.contains(110 * 64));
        assert_eq!(ewah.cardinality(), 2 + 20 * 64);
    }

    #[test]
    fn test_contains_walks_markers() {
        let mut plain = vec![0u64; 10];
        plain[3] = 0xf0;
        plain[4] = u64::MAX;
        plain[5] = u64::MAX;
        plain[8] = 1 << 63;
        let ewah = EwahBitmap::from_words(9 * 64 + 10, &plain);

        let ones = ewah.ones();
        for pos in 0..ewah.bit_size() + 64 {
            assert_eq!(ewah.contains(pos), ones.binary_search(&pos).is_ok(), "bit {}", pos);
        }
        assert!(ewah.contains(4 * 64));
        assert!(!ewah.contains(9 * 64));
    }

    #[test]
    fn test_rejects_runs_past_bit_size() {
        let good = sample(None);
        // commits bitmap: literal marker, one literal, then a 3-word zero run
        let run_marker = HEADER_LEN + 8 + 16;
        assert_eq!(&good[run_marker..run_marker + 8], &(3u64 << 1).to_be_bytes());

        let mut data = good.to_vec();
        let huge = (u32::MAX as u64) << 1 | 1;
        data[run_marker..run_marker + 8].copy_from_slice(&huge.to_be_bytes());
        assert_matches!(
            PackBitmapIndex::parse(&pack(), Bytes::from(data)),
            Err(Error::CorruptIndex { reason, .. }) if reason.contains("EWAH runs")
        );

        // One word over is enough
        let mut data = good.to_vec();
        data[run_marker..run_marker + 8].copy_from_slice(&(4u64 << 1).to_be_bytes());
        assert_matches!(
            PackBitmapIndex::parse(&pack(), Bytes::from(data)),
            Err(Error::CorruptIndex { .. })
        );
    }

    #[test]
    fn test_rejects_literals_past_word_count() {
        let pack = pack();
        let mut raw = Vec::new();
        EwahBitmap {
            bit_size: 64 * 64,
            words: vec![5u64 << 33, 1, 2],
        }
        .write(&mut raw);

        let mut cursor = Cursor {
            data: &raw,
            at: 0,
            pack: &pack,
        };
        assert_matches!(
            cursor.ewah(),
            Err(Error::CorruptIndex { reason, .. }) if reason.contains("overruns")
        );
    }

    #[test]
    fn test_parse_type_bitmaps() {
        let index = PackBitmapIndex::parse(&pack(), sample(None)).unwrap();
        assert_eq!(index.entry_count(), 2);
        assert_eq!(index.flags(), FLAG_FULL_DAG);
        assert_eq!(index.commits().ones(), vec![0, 1]);
        assert_eq!(index.trees().ones(), vec![2, 3, 130]);
        assert_eq!(index.blobs().ones(), vec![4]);
        assert_eq!(index.tags().cardinality(), 0);
        assert_eq!(index.pack_checksum(), &[7u8; CHECKSUM_LEN]);
        assert!(index.name_hashes().is_empty());
    }

    #[test]
    fn test_xor_chain_resolution() {
        let index = PackBitmapIndex::parse(&pack(), sample(None)).unwrap();
        assert_eq!(index.bitmap_for(0).unwrap().ones(), vec![0, 2, 4]);
        assert_eq!(index.bitmap_for(1).unwrap().ones(), vec![0, 1, 2, 3, 4, 130]);
        assert!(index.bitmap_for(99).is_none());
    }

    #[test]
    fn test_name_hash_cache() {
        let index = PackBitmapIndex::parse(&pack(), sample(Some(&[11, 22, 33]))).unwrap();
        assert_eq!(index.flags() & FLAG_HASH_CACHE, FLAG_HASH_CACHE);
        assert_eq!(index.name_hashes(), &[11, 22, 33]);
    }

    #[test]
    fn test_rejects_corruption() {
        let good = sample(None);

        let mut data = good.to_vec();
        data[0] = b'X';
        assert_matches!(
            PackBitmapIndex::parse(&pack(), Bytes::from(data)),
            Err(Error::CorruptIndex { .. })
        );

        assert_matches!(
            PackBitmapIndex::parse(&pack(), good.slice(..good.len() - 30)),
            Err(Error::CorruptIndex { .. })
        );

        let mut data = good.to_vec();
        data.extend_from_slice(&[1, 2, 3]);
        assert_matches!(
            PackBitmapIndex::parse(&pack(), Bytes::from(data)),
            Err(Error::CorruptIndex { .. })
        );
    }
}
