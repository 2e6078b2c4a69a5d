//! Local filesystem backend
//!
//! Layout: `<root>/<store>/<pack>.pack`, with `.idx` and `.bitmap` files
//! beside it.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use super::{check_range, PackBackend, PackChannel};
use crate::cache::key::{PackExt, PackIdentity};
use crate::error::{Error, Result};

/// Packs stored as plain files
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Serve packs below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, pack: &PackIdentity, ext: PackExt) -> PathBuf {
        self.root.join(pack.store_id()).join(ext.file_name(pack))
    }
}

#[async_trait]
impl PackBackend for FsBackend {
    async fn open(&self, pack: &PackIdentity, ext: PackExt) -> Result<Option<Arc<dyn PackChannel>>> {
        let path = self.path_of(pack, ext);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {
                debug!(path = %path.display(), size = meta.len(), "opened pack file");
                Ok(Some(Arc::new(FsChannel {
                    pack: pack.clone(),
                    ext,
                    path,
                    size: meta.len(),
                })))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_packs(&self, store_id: &str) -> Result<Vec<PackIdentity>> {
        let dir = self.root.join(store_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let suffix = format!(".{}", PackExt::Pack.extension());
        let mut packs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(pack_name) = name.strip_suffix(&suffix) {
                if !pack_name.is_empty() {
                    packs.push(PackIdentity::new(store_id, pack_name));
                }
            }
        }
        packs.sort_by(|a, b| a.pack_name().cmp(b.pack_name()));
        Ok(packs)
    }

    fn name(&self) -> &'static str {
        "fs"
    }
}

struct FsChannel {
    pack: PackIdentity,
    ext: PackExt,
    path: PathBuf,
    size: u64,
}

impl FsChannel {
    async fn read_exact_at(&self, offset: u64, length: u32) -> std::io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[async_trait]
impl PackChannel for FsChannel {
    async fn read_range(&self, offset: u64, length: u32) -> Result<Bytes> {
        check_range(&self.pack, self.ext, offset, length, self.size)?;
        self.read_exact_at(offset, length)
            .await
            .map(Bytes::from)
            .map_err(|e| Error::BackendIo {
                pack: format!("{}.{}", self.pack, self.ext),
                offset,
                length: length as u64,
                reason: e.to_string(),
            })
    }

    fn size(&self) -> u64 {
        self.size
    }
}

// =============================================================================
// Tests
// =============================================================================
