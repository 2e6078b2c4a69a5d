//! Load Coordinator
//!
//! Single-flight execution of cache fills. Concurrent misses on the same key
//! attach to one shared future instead of each reading the backend.
//!
//! The load itself runs as a spawned task, so a caller that stops waiting
//! never cancels it: the result is still installed for everyone else. The
//! pending entry is removed by the task when it finishes, panics or is torn
//! down with the runtime.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, trace};

use crate::error::{Error, Result};

// The future stored for each in-flight load. `Error` is `Clone`, so every
// waiter receives the same failure.
type SharedLoad<V> = Shared<BoxFuture<'static, Result<V>>>;

/// How a caller takes part in a load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Started the load
    Leader,
    /// Attached to a load someone else started
    Follower,
}

/// A pending load the caller can await
pub struct Flight<V: Clone> {
    role: Role,
    load: SharedLoad<V>,
}

impl<V: Clone> Flight<V> {
    /// Whether this caller started the load
    pub fn role(&self) -> Role {
        self.role
    }

    /// Wait for the shared outcome
    pub async fn wait(self) -> Result<V> {
        self.load.await
    }
}

/// Outcome of [`SingleFlight::begin`]
pub enum Attach<V: Clone> {
    /// The value turned up while the key was locked; nothing to load
    Ready(V),
    /// A load is in flight
    Pending(Flight<V>),
}

/// Removes the pending entry once the load task is gone, however it ends
struct Completion<K: Eq + Hash, V: Clone> {
    key: Option<K>,
    inflight: Arc<DashMap<K, SharedLoad<V>>>,
}

impl<K: Eq + Hash, V: Clone> Drop for Completion<K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.inflight.remove(&key);
        }
    }
}

/// Per-key single-flight coordinator
pub struct SingleFlight<K: Eq + Hash, V: Clone> {
    inflight: Arc<DashMap<K, SharedLoad<V>>>,
    started: AtomicU64,
    joined: AtomicU64,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty coordinator
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            started: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Attach to the load for `key`, starting it if none is in flight.
    ///
    /// `recheck` runs while the key is locked and no load is pending; a
    /// value it returns means another load published in the meantime and
    /// no new load is started. `load` is only called by the leader.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn begin<R, F, Fut>(&self, key: K, recheck: R, load: F) -> Attach<V>
    where
        R: FnOnce() -> Option<V>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(pending) => {
                self.joined.fetch_add(1, Ordering::Relaxed);
                trace!(?key, "joined in-flight load");
                Attach::Pending(Flight {
                    role: Role::Follower,
                    load: pending.get().clone(),
                })
            }
            Entry::Vacant(vacant) => {
                if let Some(value) = recheck() {
                    return Attach::Ready(value);
                }

                let completion = Completion {
                    key: Some(key.clone()),
                    inflight: Arc::clone(&self.inflight),
                };
                let work = load();
                let task = tokio::spawn(async move {
                    let _completion = completion;
                    work.await
                });

                let shared = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(err) => Err(Error::LoadAborted(err.to_string())),
                    }
                }
                .boxed()
                .shared();

                vacant.insert(shared.clone());
                self.started.fetch_add(1, Ordering::Relaxed);
                debug!(?key, "started load");
                Attach::Pending(Flight {
                    role: Role::Leader,
                    load: shared,
                })
            }
        }
    }

    /// Number of loads currently in flight
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Whether a load for `key` is in flight
    pub fn is_pending(&self, key: &K) -> bool {
        self.inflight.contains_key(key)
    }

    /// Loads started since creation
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Callers that attached to someone else's load
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    async fn settle<K, V>(flight: &SingleFlight<K, V>)
    where
        K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        for _ in 0..100 {
            if flight.in_flight() == 0 {
                return;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_followers_share_one_load() {
        let flight: SingleFlight<u64, u64> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let calls_leader = Arc::clone(&calls);
        let leader = match flight.begin(7, || None, move || async move {
            calls_leader.fetch_add(1, Ordering::SeqCst);
            let _ = release_rx.await;
            Ok(42)
        }) {
            Attach::Pending(f) => f,
            Attach::Ready(_) => panic!("nothing cached yet"),
        };
        assert_eq!(leader.role(), Role::Leader);

        let mut followers = Vec::new();
        for _ in 0..5 {
            match flight.begin(7, || None, || async { Ok(0) }) {
                Attach::Pending(f) => {
                    assert_eq!(f.role(), Role::Follower);
                    followers.push(f);
                }
                Attach::Ready(_) => panic!("load still pending"),
            }
        }

        release_tx.send(()).unwrap();
        assert_eq!(leader.wait().await.unwrap(), 42);
        for f in followers {
            assert_eq!(f.wait().await.unwrap(), 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.started(), 1);
        assert_eq!(flight.joined(), 5);
        settle(&flight).await;
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter() {
        let flight: SingleFlight<u64, u64> = SingleFlight::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let leader = match flight.begin(1, || None, move || async move {
            let _ = release_rx.await;
            Err(Error::BackendIo {
                pack: "repo/pack".into(),
                offset: 0,
                length: 16,
                reason: "reset".into(),
            })
        }) {
            Attach::Pending(f) => f,
            Attach::Ready(_) => unreachable!(),
        };
        let follower = match flight.begin(1, || None, || async { Ok(1) }) {
            Attach::Pending(f) => f,
            Attach::Ready(_) => unreachable!(),
        };

        release_tx.send(()).unwrap();
        assert_matches!(leader.wait().await, Err(Error::BackendIo { .. }));
        assert_matches!(follower.wait().await, Err(Error::BackendIo { .. }));

        // A failed load is not remembered
        settle(&flight).await;
        assert!(!flight.is_pending(&1));
    }

    #[tokio::test]
    async fn test_recheck_short_circuits() {
        let flight: SingleFlight<u64, u64> = SingleFlight::new();
        match flight.begin(3, || Some(9), || async { Ok(0) }) {
            Attach::Ready(v) => assert_eq!(v, 9),
            Attach::Pending(_) => panic!("recheck returned a value"),
        }
        assert_eq!(flight.started(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_cancel_load() {
        let flight: SingleFlight<u64, u64> = SingleFlight::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let done = Arc::clone(&finished);
        let leader = match flight.begin(5, || None, move || async move {
            let _ = release_rx.await;
            done.fetch_add(1, Ordering::SeqCst);
            Ok(5)
        }) {
            Attach::Pending(f) => f,
            Attach::Ready(_) => unreachable!(),
        };

        // The only waiter walks away before the load completes
        drop(leader);
        release_tx.send(()).unwrap();
        settle(&flight).await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panicking_load_is_cleaned_up() {
        let flight: SingleFlight<u64, u64> = SingleFlight::new();
        let leader = match flight.begin(11, || None, || async {
            if true {
                panic!("backend exploded");
            }
            Ok(0)
        }) {
            Attach::Pending(f) => f,
            Attach::Ready(_) => unreachable!(),
        };

        assert_matches!(leader.wait().await, Err(Error::LoadAborted(_)));
        settle(&flight).await;
        assert!(!flight.is_pending(&11));
    }
}
