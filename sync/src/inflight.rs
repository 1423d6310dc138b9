//! Coalescing of concurrent identical fetches.
//!
//! While a fetch for a key is running, further callers for the same key
//! await the same future instead of issuing another request.

use crate::error::{Result, SyncError};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::Arc;

type SharedFetch<T> = Shared<BoxFuture<'static, std::result::Result<T, Arc<SyncError>>>>;

/// Registry of running fetches keyed by e.g. blob path and hash.
pub struct InFlight<T: Clone + Send + Sync + 'static> {
    running: Arc<DashMap<String, SharedFetch<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for InFlight<T> {
    fn default() -> Self {
        Self {
            running: Arc::new(DashMap::new()),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for InFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight")
            .field("running", &self.running.len())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> InFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Await the fetch for `key`, starting it with `make` if none is running.
    ///
    /// The entry is released when the fetch completes, so a later call after
    /// a failure starts a fresh attempt.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let fetch = self
            .running
            .entry(key.to_string())
            .or_insert_with(|| {
                let running = self.running.clone();
                let owned_key = key.to_string();
                let fut = make();
                async move {
                    let result = fut.await.map_err(Arc::new);
                    running.remove(&owned_key);
                    result
                }
                .boxed()
                .shared()
            })
            .clone();

        fetch.await.map_err(unshare)
    }

    /// Number of fetches currently running.
    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}

/// Recover an owned error from one shared between callers.
fn unshare(shared: Arc<SyncError>) -> SyncError {
    Arc::try_unwrap(shared).unwrap_or_else(|shared| match &*shared {
        SyncError::Engine(err) => SyncError::Engine(err.clone()),
        SyncError::Timeout(after) => SyncError::Timeout(*after),
        other => SyncError::RemoteUnavailable(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_fetch() {
        let inflight: Arc<InFlight<Vec<u8>>> = Arc::new(InFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let inflight = inflight.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    inflight
                        .run("bills/0.json", || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(vec![1, 2, 3])
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn failure_is_released_for_retry() {
        let inflight: InFlight<u32> = InFlight::new();

        let err = inflight
            .run("k", || async { Err(SyncError::RemoteUnavailable("down".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RemoteUnavailable(ref m) if m == "down"));
        assert!(inflight.is_empty());

        let value = inflight.run("k", || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn distinct_keys_run_separately() {
        let inflight: InFlight<&'static str> = InFlight::new();
        let a = inflight.run("a", || async { Ok("a") });
        let b = inflight.run("b", || async { Ok("b") });
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
    }
}
