//! Shared provider cache keyed by connection name.
//!
//! Different lock ids on the same storage account share one backing-store
//! client. The cache is an owned object: whoever constructs lock managers
//! owns one, there is no process-wide registry.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::ProviderError;
use crate::providers::LeaseProvider;

/// Get-or-create-once cache of lease providers.
///
/// Reads take the lock-free fast path; misses serialize behind a build
/// mutex so each connection's client is constructed exactly once even under
/// concurrent first use (first writer wins, nobody constructs a duplicate).
#[derive(Default)]
pub struct ProviderCache {
    providers: DashMap<String, Arc<dyn LeaseProvider>>,
    build_lock: Mutex<()>,
}

impl ProviderCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the provider for `connection`, building it on first use.
    ///
    /// # Errors
    /// Propagates the builder's error; a failed build caches nothing, so a
    /// later call retries.
    pub async fn get_or_create<F, Fut>(
        &self,
        connection: &str,
        build: F,
    ) -> Result<Arc<dyn LeaseProvider>, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn LeaseProvider>, ProviderError>>,
    {
        if let Some(provider) = self.providers.get(connection) {
            return Ok(provider.clone());
        }

        let _guard = self.build_lock.lock().await;
        if let Some(provider) = self.providers.get(connection) {
            return Ok(provider.clone());
        }
        let provider = build().await?;
        self.providers
            .insert(connection.to_string(), provider.clone());
        Ok(provider)
    }

    /// Number of cached providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::providers::MemoryLeaseProvider;

    #[tokio::test]
    async fn builds_each_connection_once() {
        let cache = Arc::new(ProviderCache::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let builds = builds.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_create("storage-a", || async {
                        builds.fetch_add(1, Ordering::SeqCst);
                        Ok(Arc::new(MemoryLeaseProvider::new()) as Arc<dyn LeaseProvider>)
                    })
                    .await
                    .unwrap()
            }));
        }
        let providers: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
        // Everybody got the same instance.
        for provider in &providers[1..] {
            assert!(Arc::ptr_eq(&providers[0], provider));
        }
    }

    #[tokio::test]
    async fn failed_build_is_retried() {
        let cache = ProviderCache::new();
        let result = cache
            .get_or_create("storage-b", || async {
                Err(ProviderError::InvalidConfig("boom".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.is_empty());

        let result = cache
            .get_or_create("storage-b", || async {
                Ok(Arc::new(MemoryLeaseProvider::new()) as Arc<dyn LeaseProvider>)
            })
            .await;
        assert!(result.is_ok());
    }
}
