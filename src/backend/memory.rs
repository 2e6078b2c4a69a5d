//! In-memory backend for tests and tooling
//! Uses DashMap for lock-free concurrent access

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Notify;

use super::{check_range, PackBackend, PackChannel};
use crate::cache::key::{PackExt, PackIdentity};
use crate::error::{Error, Result};

/// Backend statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Files stored
    pub file_count: u64,
    /// Successful and failed `open` calls
    pub opens: u64,
    /// Range reads issued
    pub reads: u64,
    /// Bytes returned by range reads
    pub bytes_read: u64,
    /// Pack listings
    pub lists: u64,
}

struct Inner {
    files: DashMap<(PackIdentity, PackExt), Bytes>,
    failures: DashMap<PackIdentity, String>,
    read_counts: DashMap<(PackIdentity, PackExt), u64>,
    opens: AtomicU64,
    reads: AtomicU64,
    bytes_read: AtomicU64,
    lists: AtomicU64,
    in_flight: AtomicU64,
    read_delay_micros: AtomicU64,
    paused: AtomicBool,
    resume: Notify,
}

/// In-memory pack storage
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<Inner>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                files: DashMap::new(),
                failures: DashMap::new(),
                read_counts: DashMap::new(),
                opens: AtomicU64::new(0),
                reads: AtomicU64::new(0),
                bytes_read: AtomicU64::new(0),
                lists: AtomicU64::new(0),
                in_flight: AtomicU64::new(0),
                read_delay_micros: AtomicU64::new(0),
                paused: AtomicBool::new(false),
                resume: Notify::new(),
            }),
        }
    }
}

impl InMemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a pack file, replacing any previous content
    pub fn insert(&self, pack: &PackIdentity, ext: PackExt, data: Bytes) {
        self.inner.files.insert((pack.clone(), ext), data);
    }

    /// Remove every file of `pack`
    pub fn remove_pack(&self, pack: &PackIdentity) {
        self.inner.files.retain(|(p, _), _| p != pack);
    }

    /// Make every read of `pack` fail with a backend error
    pub fn fail_reads(&self, pack: &PackIdentity, reason: impl Into<String>) {
        self.inner.failures.insert(pack.clone(), reason.into());
    }

    /// Stop injecting failures
    pub fn clear_failures(&self) {
        self.inner.failures.clear();
    }

    /// Delay every read by `delay`
    pub fn set_read_delay(&self, delay: Duration) {
        self.inner
            .read_delay_micros
            .store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    /// Hold every read until [`resume`](Self::resume) is called
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    /// Release held reads
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.resume.notify_waiters();
    }

    /// Reads that have started and not yet returned
    pub fn reads_in_flight(&self) -> u64 {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Range reads issued against one file
    pub fn reads_of(&self, pack: &PackIdentity, ext: PackExt) -> u64 {
        self.inner
            .read_counts
            .get(&(pack.clone(), ext))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Get backend statistics
    pub fn stats(&self) -> BackendStats {
        BackendStats {
            file_count: self.inner.files.len() as u64,
            opens: self.inner.opens.load(Ordering::Relaxed),
            reads: self.inner.reads.load(Ordering::Relaxed),
            bytes_read: self.inner.bytes_read.load(Ordering::Relaxed),
            lists: self.inner.lists.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl PackBackend for InMemoryBackend {
    async fn open(&self, pack: &PackIdentity, ext: PackExt) -> Result<Option<Arc<dyn PackChannel>>> {
        self.inner.opens.fetch_add(1, Ordering::Relaxed);
        let size = match self.inner.files.get(&(pack.clone(), ext)) {
            Some(data) => data.len() as u64,
            None => return Ok(None),
        };
        Ok(Some(Arc::new(MemoryChannel {
            inner: Arc::clone(&self.inner),
            pack: pack.clone(),
            ext,
            size,
        })))
    }

    async fn list_packs(&self, store_id: &str) -> Result<Vec<PackIdentity>> {
        self.inner.lists.fetch_add(1, Ordering::Relaxed);
        let mut packs: Vec<PackIdentity> = self
            .inner
            .files
            .iter()
            .filter(|e| e.key().1 == PackExt::Pack && e.key().0.store_id() == store_id)
            .map(|e| e.key().0.clone())
            .collect();
        packs.sort_by(|a, b| a.pack_name().cmp(b.pack_name()));
        Ok(packs)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryChannel {
    inner: Arc<Inner>,
    pack: PackIdentity,
    ext: PackExt,
    size: u64,
}

/// Decrements the in-flight count on every exit path
struct InFlight<'a>(&'a AtomicU64);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PackChannel for MemoryChannel {
    async fn read_range(&self, offset: u64, length: u32) -> Result<Bytes> {
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
        *self
            .inner
            .read_counts
            .entry((self.pack.clone(), self.ext))
            .or_insert(0) += 1;
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight(&self.inner.in_flight);

        loop {
            let resumed = self.inner.resume.notified();
            if !self.inner.paused.load(Ordering::SeqCst) {
                break;
            }
            resumed.await;
        }
        let delay = self.inner.read_delay_micros.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_micros(delay)).await;
        }

        if let Some(reason) = self.inner.failures.get(&self.pack) {
            return Err(Error::BackendIo {
                pack: self.pack.to_string(),
                offset,
                length: length as u64,
                reason: reason.clone(),
            });
        }

        check_range(&self.pack, self.ext, offset, length, self.size)?;
        let data = self
            .inner
            .files
            .get(&(self.pack.clone(), self.ext))
            .map(|d| d.clone())
            .ok_or_else(|| Error::BackendIo {
                pack: self.pack.to_string(),
                offset,
                length: length as u64,
                reason: format!("{} file removed while open", self.ext),
            })?;

        let start = offset as usize;
        let out = data.slice(start..start + length as usize);
        self.inner
            .bytes_read
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        Ok(out)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn pack(name: &str) -> PackIdentity {
        PackIdentity::new("repo", name)
    }

    #[tokio::test]
    async fn test_open_and_read() {
        let backend = InMemoryBackend::new();
        backend.insert(&pack("a"), PackExt::Pack, Bytes::from_static(b"0123456789"));

        let channel = backend.open(&pack("a"), PackExt::Pack).await.unwrap().unwrap();
        assert_eq!(channel.size(), 10);
        assert_eq!(channel.read_range(2, 3).await.unwrap().as_ref(), b"234");
        assert_matches!(channel.read_range(8, 3).await, Err(Error::OutOfRange { .. }));

        assert!(backend.open(&pack("a"), PackExt::Bitmap).await.unwrap().is_none());
        assert_eq!(backend.reads_of(&pack("a"), PackExt::Pack), 2);

        let stats = backend.stats();
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.bytes_read, 3);
        assert_eq!(stats.opens, 2);
    }

    #[tokio::test]
    async fn test_list_packs_per_store() {
        let backend = InMemoryBackend::new();
        backend.insert(&pack("b"), PackExt::Pack, Bytes::from_static(b"x"));
        backend.insert(&pack("a"), PackExt::Pack, Bytes::from_static(b"x"));
        backend.insert(&pack("a"), PackExt::Index, Bytes::from_static(b"x"));
        backend.insert(&PackIdentity::new("other", "c"), PackExt::Pack, Bytes::from_static(b"x"));

        let listed = backend.list_packs("repo").await.unwrap();
        assert_eq!(listed, vec![pack("a"), pack("b")]);

        backend.remove_pack(&pack("a"));
        assert_eq!(backend.list_packs("repo").await.unwrap(), vec![pack("b")]);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let backend = InMemoryBackend::new();
        backend.insert(&pack("a"), PackExt::Pack, Bytes::from_static(b"data"));
        let channel = backend.open(&pack("a"), PackExt::Pack).await.unwrap().unwrap();

        backend.fail_reads(&pack("a"), "connection reset");
        assert_matches!(channel.read_range(0, 4).await, Err(Error::BackendIo { .. }));

        backend.clear_failures();
        assert!(channel.read_range(0, 4).await.is_ok());
    }

    #[tokio::test]
    async fn test_pause_holds_reads() {
        let backend = InMemoryBackend::new();
        backend.insert(&pack("a"), PackExt::Pack, Bytes::from_static(b"data"));
        let channel = backend.open(&pack("a"), PackExt::Pack).await.unwrap().unwrap();

        backend.pause();
        let read = tokio::spawn(async move { channel.read_range(0, 4).await });
        while backend.reads_in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!read.is_finished());

        backend.resume();
        assert_eq!(read.await.unwrap().unwrap().as_ref(), b"data");
        assert_eq!(backend.reads_in_flight(), 0);
    }

    #[test]
    fn test_resume_wakes_parked_read() {
        use tokio_test::{assert_pending, assert_ready_ok, task};

        let backend = InMemoryBackend::new();
        backend.insert(&pack("a"), PackExt::Pack, Bytes::from_static(b"data"));
        let channel = tokio_test::block_on(backend.open(&pack("a"), PackExt::Pack))
            .unwrap()
            .unwrap();

        backend.pause();
        let mut read = task::spawn(channel.read_range(1, 2));
        assert_pending!(read.poll());
        assert_pending!(read.poll());
        assert_eq!(backend.reads_in_flight(), 1);

        backend.resume();
        assert!(read.is_woken());
        let bytes = assert_ready_ok!(read.poll());
        assert_eq!(bytes.as_ref(), b"at");
        assert_eq!(backend.reads_in_flight(), 0);
    }
}
