//! Cached Blocks
//!
//! A block is an immutable byte range of one pack. Readers receive a
//! [`BlockHandle`]; while any handle is alive the block stays resident.

use bytes::Bytes;

use super::key::BlockKey;
use super::table::{Pinned, Weighted};
use crate::error::{Error, Result};

/// One block of pack data
#[derive(Clone)]
pub struct Block {
    key: BlockKey,
    /// Pack offset of the first byte
    start: u64,
    data: Bytes,
}

impl Block {
    /// Create a block starting at pack offset `start`
    pub fn new(key: BlockKey, start: u64, data: Bytes) -> Self {
        Self { key, start, data }
    }

    /// Cache key
    #[inline]
    pub fn key(&self) -> &BlockKey {
        &self.key
    }

    /// Pack offset of the first byte
    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Pack offset one past the last byte
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    /// Block contents (zero-copy)
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Block size in bytes; shorter than the block size only at pack end
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Whether pack offset `offset` falls in this block
    #[inline]
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }
}

impl Weighted for Block {
    fn weight(&self) -> u64 {
        self.data.len() as u64
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("key", &self.key)
            .field("start", &self.start)
            .field("size", &self.data.len())
            .finish()
    }
}

/// Pinned, reference-counted view of a cached block.
///
/// Cloning takes another pin; dropping releases one.
#[derive(Clone, Debug)]
pub struct BlockHandle {
    block: Pinned<Block>,
}

impl BlockHandle {
    pub(crate) fn new(block: Pinned<Block>) -> Self {
        Self { block }
    }

    /// Cache key of the underlying block
    pub fn key(&self) -> &BlockKey {
        self.block.key()
    }

    /// Pack offset of the first byte
    pub fn start(&self) -> u64 {
        self.block.start()
    }

    /// Block contents
    pub fn data(&self) -> &Bytes {
        self.block.data()
    }

    /// Block size in bytes
    pub fn size(&self) -> usize {
        self.block.size()
    }

    /// Number of live handles on this block
    pub fn pin_count(&self) -> usize {
        self.block.pin_count()
    }

    /// Zero-copy slice of `[offset, offset + length)` in pack coordinates.
    /// The range must lie inside this block.
    pub fn slice(&self, offset: u64, length: usize) -> Result<Bytes> {
        let end = offset.checked_add(length as u64);
        match end {
            Some(end) if offset >= self.block.start() && end <= self.block.end() => {
                let from = (offset - self.block.start()) as usize;
                Ok(self.block.data().slice(from..from + length))
            }
            _ => Err(Error::OutOfRange {
                pack: self.block.key().pack().to_string(),
                offset,
                length: length as u64,
                size: self.block.end(),
            }),
        }
    }

    /// Bytes from pack offset `offset` to the end of this block
    pub fn tail(&self, offset: u64) -> Result<Bytes> {
        let available = self.block.end().saturating_sub(offset) as usize;
        self.slice(offset, available)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::PackIdentity;
    use crate::cache::table::ClockTable;
    use assert_matches::assert_matches;

    fn block(number: u64, data: &'static [u8]) -> Block {
        let key = BlockKey::new(PackIdentity::new("repo", "pack-1"), number);
        Block::new(key, number * 16, Bytes::from_static(data))
    }

    #[test]
    fn test_block_bounds() {
        let b = block(2, b"0123456789abcdef");
        assert_eq!(b.start(), 32);
        assert_eq!(b.end(), 48);
        assert_eq!(b.size(), 16);
        assert!(b.contains(32));
        assert!(b.contains(47));
        assert!(!b.contains(48));
        assert_eq!(b.weight(), 16);
    }

    #[test]
    fn test_handle_slice() {
        let table = ClockTable::new(1024, 1);
        let b = block(1, b"0123456789abcdef");
        let handle = BlockHandle::new(table.insert(b.key().clone(), b));

        assert_eq!(handle.slice(16, 4).unwrap().as_ref(), b"0123");
        assert_eq!(handle.slice(28, 4).unwrap().as_ref(), b"cdef");
        assert_eq!(handle.tail(30).unwrap().as_ref(), b"ef");
        assert_matches!(handle.slice(15, 2), Err(Error::OutOfRange { .. }));
        assert_matches!(handle.slice(30, 4), Err(Error::OutOfRange { .. }));
        assert_matches!(handle.slice(u64::MAX, 2), Err(Error::OutOfRange { .. }));
    }

    #[test]
    fn test_handle_clone_pins() {
        let table = ClockTable::new(1024, 1);
        let b = block(0, b"abcd");
        let key = b.key().clone();
        let handle = BlockHandle::new(table.insert(key.clone(), b));
        let copy = handle.clone();
        assert_eq!(handle.pin_count(), 2);
        assert!(!table.invalidate(&key));
        drop(copy);
        drop(handle);
        assert!(table.invalidate(&key));
    }
}
