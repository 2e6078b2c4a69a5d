//! Reader Sessions
//!
//! A [`PackReader`] is one session over a shared [`BlockCache`]. It owns its
//! statistics accumulator, so every operation takes `&mut self` and
//! counting needs no synchronization. Run sessions concurrently by giving
//! each task its own reader and merging the snapshots afterwards.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info_span, trace, warn, Instrument, Span};
use uuid::Uuid;

use crate::cache::block::BlockHandle;
use crate::cache::compression::{RecordHeader, RECORD_HEADER_LEN};
use crate::cache::key::{BlockKey, PackIdentity};
use crate::cache::manager::{BlockCache, BlockSource};
use crate::cache::stats::{StatsAccumulator, StatsSnapshot};
use crate::error::{Error, Result};
use crate::pack::{PackBitmapIndex, PackIndex};

/// One reader session
pub struct PackReader {
    id: Uuid,
    store_id: Arc<str>,
    cache: BlockCache,
    stats: StatsAccumulator,
    span: Span,
}

impl PackReader {
    /// Open a session on the packs of `store_id`
    pub fn new(cache: BlockCache, store_id: impl AsRef<str>) -> Self {
        let id = Uuid::new_v4();
        let store_id: Arc<str> = Arc::from(store_id.as_ref());
        let span = info_span!("reader", session = %id, store = %store_id);
        debug!(parent: &span, "reader session opened");
        Self {
            id,
            store_id,
            cache,
            stats: StatsAccumulator::new(),
            span,
        }
    }

    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Store this session reads from
    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Shared cache behind this session
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Snapshot of this session's counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Pin the block holding `[offset, offset + length)`.
    ///
    /// The range must lie inside one block and inside the pack.
    pub async fn request_block(&mut self, pack: &PackIdentity, offset: u64, length: u64) -> Result<BlockHandle> {
        let block_size = self.cache.config().block_size;
        let size = self
            .cache
            .pack_size(pack)
            .instrument(self.span.clone())
            .await?;

        let out_of_range = || Error::OutOfRange {
            pack: pack.to_string(),
            offset,
            length,
            size,
        };
        let end = offset.checked_add(length).ok_or_else(out_of_range)?;
        let block = offset / block_size;
        let block_end = (block + 1).saturating_mul(block_size);
        if end > size || end > block_end || offset >= size {
            return Err(out_of_range());
        }

        self.acquire(BlockKey::new(pack.clone(), block)).await
    }

    /// Release a block handle. Dropping the handle does the same.
    pub fn release_block(&mut self, handle: BlockHandle) {
        trace!(parent: &self.span, key = ?handle.key(), "release block");
        drop(handle);
    }

    /// Fetch a block and count the event
    async fn acquire(&mut self, key: BlockKey) -> Result<BlockHandle> {
        let fetch = self.cache.block(&key).instrument(self.span.clone()).await?;
        match fetch.source {
            BlockSource::Cache => self.stats.record_block_hit(),
            BlockSource::Backend => {
                if let Some(cost) = fetch.cost {
                    self.stats.record_block_load(cost.bytes, cost.micros);
                }
            }
            // Counted by the session that received the load first
            BlockSource::Shared => {}
        }
        Ok(fetch.handle)
    }

    /// Copy of `[offset, offset + length)`, which may span blocks. Each
    /// block is released before the next one is requested.
    pub async fn read_range(&mut self, pack: &PackIdentity, offset: u64, length: u64) -> Result<Bytes> {
        let size = self
            .cache
            .pack_size(pack)
            .instrument(self.span.clone())
            .await?;
        let end = match offset.checked_add(length) {
            Some(end) if end <= size => end,
            _ => {
                return Err(Error::OutOfRange {
                    pack: pack.to_string(),
                    offset,
                    length,
                    size,
                })
            }
        };
        if length == 0 {
            return Ok(Bytes::new());
        }

        let block_size = self.cache.config().block_size;
        let mut out: Option<BytesMut> = None;
        let mut pos = offset;
        while pos < end {
            let handle = self
                .acquire(BlockKey::for_offset(pack.clone(), pos, block_size))
                .await?;
            let take = (end.min(handle.start() + handle.size() as u64) - pos) as usize;
            let piece = handle.slice(pos, take)?;
            drop(handle);

            if pos == offset && pos + take as u64 == end {
                return Ok(piece);
            }
            out.get_or_insert_with(|| BytesMut::with_capacity(length as usize))
                .extend_from_slice(&piece);
            pos += take as u64;
        }
        Ok(out.map(BytesMut::freeze).unwrap_or_default())
    }

    /// Parsed pack index of `pack`
    pub async fn get_index(&mut self, pack: &PackIdentity) -> Result<Arc<PackIndex>> {
        let lookup = self.cache.index(pack).instrument(self.span.clone()).await?;
        if let Some(cost) = lookup.cost {
            self.stats.record_index_load(cost.bytes, cost.micros);
        }
        Ok(lookup.value)
    }

    /// Bitmap index of `pack`, `None` if the pack has none
    pub async fn get_bitmap(&mut self, pack: &PackIdentity) -> Result<Option<Arc<PackBitmapIndex>>> {
        let lookup = self.cache.bitmap(pack).instrument(self.span.clone()).await?;
        if let Some(cost) = lookup.cost {
            self.stats.record_bitmap_load(cost.bytes, cost.micros);
        }
        Ok(lookup.value)
    }

    /// Rescan the store's pack list
    pub async fn scan_packs(&mut self) -> Result<Vec<PackIdentity>> {
        let scan = self
            .cache
            .scan_packs(&self.store_id)
            .instrument(self.span.clone())
            .await?;
        self.stats.record_scan_packs();
        Ok(scan.packs)
    }

    /// Decode the compressed record starting at pack offset `offset`. The
    /// record may span blocks.
    pub async fn inflate_at(&mut self, pack: &PackIdentity, offset: u64) -> Result<Bytes> {
        let block_size = self.cache.config().block_size;
        let size = self
            .cache
            .pack_size(pack)
            .instrument(self.span.clone())
            .await?;
        let first_block = offset / block_size;
        let integrity = |reason: String| Error::DataIntegrity {
            pack: pack.to_string(),
            block: first_block,
            reason,
        };

        let mut record = BytesMut::new();
        let mut needed = RECORD_HEADER_LEN;
        let mut header: Option<RecordHeader> = None;
        let mut pos = offset;

        while record.len() < needed {
            let handle = match self
                .acquire(BlockKey::for_offset(pack.clone(), pos, block_size))
                .await
            {
                Ok(handle) => handle,
                Err(Error::OutOfRange { .. }) if pos > offset => {
                    return Err(integrity(format!(
                        "record at {} runs past the end of the pack",
                        offset
                    )));
                }
                Err(e) => return Err(e),
            };
            let tail = handle.tail(pos)?;
            if tail.is_empty() {
                // Short final block: the pack ends inside the record
                return Err(integrity(format!(
                    "record at {} runs past the end of the pack",
                    offset
                )));
            }
            let mut rest = &tail[..];
            while !rest.is_empty() && record.len() < needed {
                let take = rest.len().min(needed - record.len());
                record.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
                pos += take as u64;

                if header.is_none() && record.len() >= RECORD_HEADER_LEN {
                    let parsed = RecordHeader::parse(&record).map_err(|e| integrity(e.to_string()))?;
                    if parsed.record_len() as u64 > size.saturating_sub(offset) {
                        return Err(integrity(format!(
                            "record at {} claims {} bytes but the pack ends at {}",
                            offset,
                            parsed.record_len(),
                            size
                        )));
                    }
                    needed = parsed.record_len();
                    header = Some(parsed);
                }
            }
            drop(handle);
        }

        let inflated = self
            .cache
            .inflater()
            .inflate_record(&record)
            .map_err(|e| {
                warn!(parent: &self.span, %pack, offset, "corrupt record: {}", e);
                integrity(e.to_string())
            })?;
        self.stats.record_decompressed(inflated.len() as u64);
        Ok(inflated)
    }

    /// Decode a record lying entirely inside a pinned block, at
    /// `offset_in_block` and `length` bytes long
    pub fn inflate(&mut self, handle: &BlockHandle, offset_in_block: usize, length: usize) -> Result<Bytes> {
        let record = handle.slice(handle.start() + offset_in_block as u64, length)?;
        let inflated = self
            .cache
            .inflater()
            .inflate_record(&record)
            .map_err(|e| {
                warn!(parent: &self.span, key = ?handle.key(), offset_in_block, "corrupt record: {}", e);
                Error::DataIntegrity {
                    pack: handle.key().pack().to_string(),
                    block: handle.key().block_number(),
                    reason: e.to_string(),
                }
            })?;
        self.stats.record_decompressed(inflated.len() as u64);
        Ok(inflated)
    }
}

impl Drop for PackReader {
    fn drop(&mut self) {
        let stats = self.stats.snapshot();
        debug!(
            parent: &self.span,
            block_cache_hits = stats.block_cache_hits,
            block_loads = stats.block_loads,
            index_loads = stats.index_loads,
            decompressed_bytes = stats.decompressed_bytes,
            "reader session closed"
        );
    }
}

impl std::fmt::Debug for PackReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackReader")
            .field("id", &self.id)
            .field("store_id", &self.store_id)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::cache::compression::{CompressionAlgorithm, Inflater};
    use crate::cache::key::PackExt;
    use crate::config::CacheConfig;
    use assert_matches::assert_matches;

    const BLOCK: u64 = 512;

    fn cache_over(backend: &InMemoryBackend) -> BlockCache {
        let config = CacheConfig::default()
            .with_block_size(BLOCK)
            .with_capacity(BLOCK * 16)
            .with_shards(4);
        BlockCache::new(config, Arc::new(backend.clone())).unwrap()
    }

    fn plain_pack(backend: &InMemoryBackend, len: usize) -> PackIdentity {
        let pack = PackIdentity::new("repo", "pack-1");
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        backend.insert(&pack, PackExt::Pack, Bytes::from(data));
        pack
    }

    #[tokio::test]
    async fn test_request_block_counts_hits_and_loads() {
        let backend = InMemoryBackend::new();
        let pack = plain_pack(&backend, 2000);
        let mut reader = PackReader::new(cache_over(&backend), "repo");

        let handle = reader.request_block(&pack, 600, 100).await.unwrap();
        assert_eq!(handle.key().block_number(), 1);
        assert_eq!(handle.slice(600, 2).unwrap().as_ref(), &[88, 89]);
        reader.release_block(handle);

        for _ in 0..3 {
            drop(reader.request_block(&pack, 512, 512).await.unwrap());
        }

        let stats = reader.stats();
        assert_eq!(stats.block_loads, 1);
        assert_eq!(stats.block_cache_hits, 3);
        assert_eq!(stats.block_bytes_read, BLOCK);
    }

    #[tokio::test]
    async fn test_request_block_rejects_bad_ranges() {
        let backend = InMemoryBackend::new();
        let pack = plain_pack(&backend, 1000);
        let mut reader = PackReader::new(cache_over(&backend), "repo");

        // Crosses a block boundary
        assert_matches!(
            reader.request_block(&pack, 500, 20).await,
            Err(Error::OutOfRange { .. })
        );
        // Past the end of the pack
        assert_matches!(
            reader.request_block(&pack, 990, 20).await,
            Err(Error::OutOfRange { .. })
        );
        assert_matches!(
            reader.request_block(&pack, u64::MAX, 2).await,
            Err(Error::OutOfRange { .. })
        );
        assert_eq!(reader.stats(), StatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_read_range_spans_blocks() {
        let backend = InMemoryBackend::new();
        let pack = plain_pack(&backend, 2000);
        let mut reader = PackReader::new(cache_over(&backend), "repo");

        let bytes = reader.read_range(&pack, 500, 1100).await.unwrap();
        let expected: Vec<u8> = (500..1600).map(|i| (i % 256) as u8).collect();
        assert_eq!(bytes.as_ref(), &expected[..]);
        assert_eq!(reader.stats().block_loads, 4);

        let within = reader.read_range(&pack, 10, 20).await.unwrap();
        assert_eq!(within.len(), 20);
        assert_eq!(reader.stats().block_cache_hits, 1);
        assert!(reader.read_range(&pack, 0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inflate_at_spanning_record() {
        let backend = InMemoryBackend::new();
        let pack = PackIdentity::new("repo", "pack-1");
        let payload: Vec<u8> = b"object contents ".iter().cycle().take(3000).copied().collect();
        let record = Inflater::new()
            .encode_record(&payload, CompressionAlgorithm::None)
            .unwrap();

        let mut file = vec![0u8; 500];
        file.extend_from_slice(&record);
        backend.insert(&pack, PackExt::Pack, Bytes::from(file));

        let mut reader = PackReader::new(cache_over(&backend), "repo");
        let inflated = reader.inflate_at(&pack, 500).await.unwrap();
        assert_eq!(inflated.as_ref(), &payload[..]);
        assert_eq!(reader.stats().decompressed_bytes, 3000);
    }

    #[tokio::test]
    async fn test_inflate_within_handle() {
        let backend = InMemoryBackend::new();
        let pack = PackIdentity::new("repo", "pack-1");
        let record = Inflater::new()
            .encode_record(&[7u8; 300], CompressionAlgorithm::Lz4)
            .unwrap();
        let mut file = vec![0u8; 8];
        file.extend_from_slice(&record);
        backend.insert(&pack, PackExt::Pack, Bytes::from(file));

        let mut reader = PackReader::new(cache_over(&backend), "repo");
        let handle = reader.request_block(&pack, 8, record.len() as u64).await.unwrap();
        let inflated = reader.inflate(&handle, 8, record.len()).unwrap();
        assert_eq!(inflated.as_ref(), &[7u8; 300][..]);
        assert_eq!(reader.stats().decompressed_bytes, 300);

        assert_matches!(
            reader.inflate(&handle, 9, record.len() - 1),
            Err(Error::DataIntegrity { block: 0, .. })
        );
    }

    #[tokio::test]
    async fn test_truncated_record_is_integrity_error() {
        let backend = InMemoryBackend::new();
        let pack = PackIdentity::new("repo", "pack-1");
        let record = Inflater::new()
            .encode_record(&[1u8; 900], CompressionAlgorithm::None)
            .unwrap();
        backend.insert(&pack, PackExt::Pack, record.slice(..700));

        let mut reader = PackReader::new(cache_over(&backend), "repo");
        assert_matches!(
            reader.inflate_at(&pack, 0).await,
            Err(Error::DataIntegrity { block: 0, .. })
        );
        assert_eq!(reader.stats().decompressed_bytes, 0);
    }

    #[tokio::test]
    async fn test_oversized_record_length_rejected_before_reading() {
        let backend = InMemoryBackend::new();
        let pack = PackIdentity::new("repo", "pack-1");
        let mut record = Inflater::new()
            .encode_record(&[3u8; 100], CompressionAlgorithm::None)
            .unwrap()
            .to_vec();
        record[1..5].copy_from_slice(&u32::MAX.to_le_bytes());
        let mut file = record;
        file.resize(BLOCK as usize * 8, 0);
        backend.insert(&pack, PackExt::Pack, Bytes::from(file));

        let mut reader = PackReader::new(cache_over(&backend), "repo");
        assert_matches!(
            reader.inflate_at(&pack, 0).await,
            Err(Error::DataIntegrity { block: 0, reason, .. }) if reason.contains("claims")
        );
        let stats = reader.stats();
        assert_eq!(stats.block_loads, 1);
        assert_eq!(stats.decompressed_bytes, 0);
        assert_eq!(backend.reads_of(&pack, PackExt::Pack), 1);
    }

    #[tokio::test]
    async fn test_scan_counts_once_per_call() {
        let backend = InMemoryBackend::new();
        plain_pack(&backend, 10);
        let mut reader = PackReader::new(cache_over(&backend), "repo");

        assert_eq!(reader.scan_packs().await.unwrap().len(), 1);
        assert_eq!(reader.scan_packs().await.unwrap().len(), 1);
        assert_eq!(reader.stats().scan_packs, 2);
        assert_eq!(reader.store_id(), "repo");
    }
}
