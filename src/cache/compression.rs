//! Compressed Record Codec
//!
//! Objects inside a pack are stored as self-describing records:
//!
//! ```text
//! ┌─────┬────────────────┬──────────────┬──────────────┬─────────────┐
//! │ tag │ compressed_len │ inflated_len │ content_hash │ payload ... │
//! │ u8  │ u32 LE         │ u32 LE       │ u64 LE       │             │
//! └─────┴────────────────┴──────────────┴──────────────┴─────────────┘
//! ```
//!
//! Tag 0 is stored verbatim, tag 1 is an LZ4 block. The content hash covers
//! the inflated bytes, so any corruption of header or payload is caught.
//!
//! # Example
//!
//! ```
//! use packcache::cache::compression::{CompressionAlgorithm, Inflater};
//!
//! let inflater = Inflater::new();
//! let data = b"Hello, this is test data that should compress well!";
//! let record = inflater.encode_record(data, CompressionAlgorithm::Lz4).unwrap();
//!
//! let inflated = inflater.inflate_record(&record).unwrap();
//! assert_eq!(inflated.as_ref(), data);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::key::fx_hash;
use crate::error::{Error, Result};

/// Size of the fixed record header
pub const RECORD_HEADER_LEN: usize = 17;

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// LZ4 - fast compression
    #[default]
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// On-disk tag
    pub fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    /// Algorithm for an on-disk tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data whose inflated size is known
    fn decompress(&self, data: &[u8], inflated_len: usize) -> Result<Vec<u8>>;
}

/// Pass-through compressor (no compression)
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _inflated_len: usize) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 block compressor
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    /// Create new LZ4 compressor with default settings
    pub fn new() -> Self {
        Self { level: 4 }
    }

    /// Create with custom compression level
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            false,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8], inflated_len: usize) -> Result<Vec<u8>> {
        let size = i32::try_from(inflated_len).map_err(|_| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: format!("inflated length {} too large", inflated_len),
        })?;
        lz4::block::decompress(data, Some(size)).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Record Header
// =============================================================================

/// Decoded record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub algorithm: CompressionAlgorithm,
    pub compressed_len: u32,
    pub inflated_len: u32,
    pub content_hash: u64,
}

impl RecordHeader {
    /// Total record length, header included
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_LEN + self.compressed_len as usize
    }

    /// Parse the fixed header at the start of `bytes`
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECORD_HEADER_LEN {
            return Err(format_violation(format!(
                "record header truncated: {} of {} bytes",
                bytes.len(),
                RECORD_HEADER_LEN
            )));
        }
        let algorithm = CompressionAlgorithm::from_tag(bytes[0])
            .ok_or_else(|| format_violation(format!("unknown compression tag {}", bytes[0])))?;
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mut hash = [0u8; 8];
        hash.copy_from_slice(&bytes[9..17]);

        Ok(Self {
            algorithm,
            compressed_len: u32_at(1),
            inflated_len: u32_at(5),
            content_hash: u64::from_le_bytes(hash),
        })
    }
}

fn format_violation(reason: String) -> Error {
    Error::DecompressionFailed {
        algorithm: "record".into(),
        reason,
    }
}

// =============================================================================
// Inflater
// =============================================================================

/// Encodes and decodes compressed records
pub struct Inflater {
    noop: NoopCompressor,
    lz4: Lz4Compressor,
}

impl Inflater {
    /// Create an inflater with default compressor settings
    pub fn new() -> Self {
        Self::with_level(4)
    }

    /// Create with a custom LZ4 level for encoding
    pub fn with_level(level: i32) -> Self {
        Self {
            noop: NoopCompressor,
            lz4: Lz4Compressor::with_level(level),
        }
    }

    /// Get compressor for algorithm
    fn compressor(&self, algorithm: CompressionAlgorithm) -> &dyn Compressor {
        match algorithm {
            CompressionAlgorithm::None => &self.noop,
            CompressionAlgorithm::Lz4 => &self.lz4,
        }
    }

    /// Build a record for `data`. Falls back to storing the data verbatim
    /// when compression does not make it smaller.
    pub fn encode_record(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        let inflated_len = u32::try_from(data.len()).map_err(|_| Error::CompressionFailed {
            algorithm: algorithm.name().into(),
            reason: format!("object of {} bytes is too large", data.len()),
        })?;

        let compressed = self.compressor(algorithm).compress(data)?;
        let (algorithm, payload) = if compressed.len() < data.len() {
            (algorithm, compressed)
        } else {
            (CompressionAlgorithm::None, data.to_vec())
        };

        let mut out = BytesMut::with_capacity(RECORD_HEADER_LEN + payload.len());
        out.put_u8(algorithm.tag());
        out.put_u32_le(payload.len() as u32);
        out.put_u32_le(inflated_len);
        out.put_u64_le(fx_hash(data));
        out.put_slice(&payload);
        Ok(out.freeze())
    }

    /// Inflate one complete record and verify it against its header
    pub fn inflate_record(&self, record: &[u8]) -> Result<Bytes> {
        let header = RecordHeader::parse(record)?;
        if record.len() < header.record_len() {
            return Err(format_violation(format!(
                "record payload truncated: {} of {} bytes",
                record.len() - RECORD_HEADER_LEN,
                header.compressed_len
            )));
        }
        let payload = &record[RECORD_HEADER_LEN..header.record_len()];
        let inflated = self
            .compressor(header.algorithm)
            .decompress(payload, header.inflated_len as usize)?;

        if inflated.len() != header.inflated_len as usize {
            return Err(format_violation(format!(
                "inflated {} bytes, header says {}",
                inflated.len(),
                header.inflated_len
            )));
        }
        if fx_hash(&inflated) != header.content_hash {
            return Err(format_violation("content hash mismatch".into()));
        }
        Ok(Bytes::from(inflated))
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}
