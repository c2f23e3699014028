//! Per-run artifact cache.
//!
//! Several planning units often need the same expensive artifact (a test
//! binary compiled for one architecture, a container image for one variant).
//! [`RunCache`] computes each key at most once per run: concurrent callers
//! for the same key wait on the first computation and share its value.
//! A failed computation is not cached, so the next caller retries.
//!
//! # Example
//!
//! ```
//! use integrun::cache::RunCache;
//!
//! # tokio_test::block_on(async {
//! let cache: RunCache<String> = RunCache::new();
//! let image = cache
//!     .get_or_try_init("wolfi/amd64", || async {
//!         Ok::<_, std::io::Error>("elastic-agent-wolfi:9.1.0-tests".to_string())
//!     })
//!     .await?;
//! assert_eq!(cache.get("wolfi/amd64"), Some(image));
//! # Ok::<(), std::io::Error>(())
//! # }).unwrap();
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

/// Compute-once map of run artifacts.
pub struct RunCache<V> {
    cells: Mutex<HashMap<String, Arc<OnceCell<V>>>>,
}

impl<V: Clone> RunCache<V> {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    fn cell(&self, key: &str) -> Arc<OnceCell<V>> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.entry(key.to_string()).or_default().clone()
    }

    /// Returns the value for `key`, computing it with `init` if no earlier
    /// call succeeded.
    pub async fn get_or_try_init<F, Fut, E>(&self, key: &str, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = self.cell(key);
        cell.get_or_try_init(init).await.cloned()
    }

    /// The cached value, if one was computed.
    pub fn get(&self, key: &str) -> Option<V> {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.get(key).and_then(|c| c.get().cloned())
    }

    pub fn len(&self) -> usize {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.values().filter(|c| c.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for RunCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_computes_once_under_concurrency() {
        let cache: Arc<RunCache<u32>> = Arc::new(RunCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_try_init("amd64", || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                            Ok::<_, String>(42)
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let cache: RunCache<u32> = RunCache::new();
        let first = cache
            .get_or_try_init("arm64", || async { Err::<u32, _>("compile failed") })
            .await;
        assert!(first.is_err());
        assert!(cache.get("arm64").is_none());
        assert!(cache.is_empty());

        let second = cache
            .get_or_try_init("arm64", || async { Ok::<_, &str>(7) })
            .await;
        assert_eq!(second, Ok(7));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let cache: RunCache<&'static str> = RunCache::new();
        cache
            .get_or_try_init("a", || async { Ok::<_, ()>("one") })
            .await
            .unwrap();
        cache
            .get_or_try_init("b", || async { Ok::<_, ()>("two") })
            .await
            .unwrap();
        assert_eq!(cache.get("a"), Some("one"));
        assert_eq!(cache.get("b"), Some("two"));
    }
}
