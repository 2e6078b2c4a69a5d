//! Pack Storage Backends
//!
//! The cache reads packs through two small traits. A backend resolves a
//! pack file to a channel; a channel is a read-only, randomly addressable
//! byte source with a known size.
//!
//! Implementations:
//!
//! - [`InMemoryBackend`]: `DashMap` of files, with read counters and fault
//!   injection for tests
//! - [`FsBackend`]: `<root>/<store>/<pack>.{pack,idx,bitmap}` on local disk
//! - [`HttpBackend`]: ranged `GET` and `HEAD` against an object store

mod fs;
mod http;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::key::{PackExt, PackIdentity};
use crate::error::{Error, Result};

pub use fs::FsBackend;
pub use http::{HttpBackend, HttpBackendConfig};
pub use memory::{BackendStats, InMemoryBackend};

/// Read-only byte source for one pack file
#[async_trait]
pub trait PackChannel: Send + Sync {
    /// Read exactly `length` bytes starting at `offset`.
    ///
    /// Fails with [`Error::OutOfRange`] if the range runs past the end of
    /// the file and with [`Error::BackendIo`] on transport failure.
    async fn read_range(&self, offset: u64, length: u32) -> Result<Bytes>;

    /// File size in bytes
    fn size(&self) -> u64;
}

/// Storage holding the packs of one or more stores
#[async_trait]
pub trait PackBackend: Send + Sync {
    /// Open a pack file. `Ok(None)` means the file does not exist, which is
    /// normal for bitmaps.
    async fn open(&self, pack: &PackIdentity, ext: PackExt) -> Result<Option<Arc<dyn PackChannel>>>;

    /// Packs currently present in `store_id`
    async fn list_packs(&self, store_id: &str) -> Result<Vec<PackIdentity>>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Check a read against the file size
pub(crate) fn check_range(pack: &PackIdentity, ext: PackExt, offset: u64, length: u32, size: u64) -> Result<()> {
    match offset.checked_add(length as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::OutOfRange {
            pack: format!("{}.{}", pack, ext),
            offset,
            length: length as u64,
            size,
        }),
    }
}

/// Read a whole file through its channel
pub async fn read_all(channel: &dyn PackChannel) -> Result<Bytes> {
    let size = channel.size();
    let length = u32::try_from(size).map_err(|_| {
        Error::Internal(format!("file of {} bytes is too large to read at once", size))
    })?;
    if length == 0 {
        return Ok(Bytes::new());
    }
    channel.read_range(0, length).await
}
