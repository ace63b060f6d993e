//! Bookkeeping of the cloud resources this controller is responsible for

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Thread safe key -> object store. Pools snapshot it to decide what to
/// garbage collect.
#[async_trait]
pub trait Snapshotter<T>: Send + Sync {
    /// Copy of every entry. Not linearizable with concurrent writes.
    async fn snapshot(&self) -> HashMap<String, T>;
    async fn get(&self, key: &str) -> Option<T>;
    async fn add(&self, key: &str, obj: T);
    async fn delete(&self, key: &str);
}

/// Plain in-memory snapshotter
pub struct InMemoryPool<T> {
    objects: Arc<RwLock<HashMap<String, T>>>,
}

impl<T> InMemoryPool<T> {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<T> Default for InMemoryPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for InMemoryPool<T> {
    fn clone(&self) -> Self {
        Self {
            objects: self.objects.clone(),
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> Snapshotter<T> for InMemoryPool<T> {
    async fn snapshot(&self) -> HashMap<String, T> {
        self.objects.read().await.clone()
    }

    async fn get(&self, key: &str) -> Option<T> {
        self.objects.read().await.get(key).cloned()
    }

    async fn add(&self, key: &str, obj: T) {
        self.objects.write().await.insert(key.to_string(), obj);
    }

    async fn delete(&self, key: &str) {
        self.objects.write().await.remove(key);
    }
}

/// Source of objects for a relisting pool.
#[async_trait]
pub trait CloudLister<T>: Send + Sync {
    async fn list(&self) -> Result<Vec<T>>;
}

/// Maps a listed object to its pool key, or rejects it (e.g. a resource not
/// named after this cluster).
pub type KeyFunc<T> = Arc<dyn Fn(&T) -> Result<String> + Send + Sync>;

/// In-memory pool that periodically re-inserts everything the cloud lists,
/// so resources created by a previous controller instance or outside the
/// controller become visible to garbage collection.
///
/// Relisting only ever adds: an explicit `delete` is the only way out.
pub struct CloudListingPool<T> {
    pool: InMemoryPool<T>,
    lister: Arc<dyn CloudLister<T>>,
    key_fn: KeyFunc<T>,
    relist: Option<JoinHandle<()>>,
}

impl<T: Clone + Send + Sync + 'static> CloudListingPool<T> {
    /// Create the pool and start relisting every `period`. Outside a tokio
    /// runtime no background relist is started; call `replenish` instead.
    pub fn new(lister: Arc<dyn CloudLister<T>>, key_fn: KeyFunc<T>, period: Duration) -> Self {
        let mut pool = Self::without_relist(lister, key_fn);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let worker = pool.clone_inner();
                pool.relist = Some(handle.spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    loop {
                        ticker.tick().await;
                        worker.replenish().await;
                    }
                }));
            }
            Err(_) => warn!("No tokio runtime, cloud listing pool will not relist"),
        }
        pool
    }

    /// Pool that only replenishes when asked to.
    pub fn without_relist(lister: Arc<dyn CloudLister<T>>, key_fn: KeyFunc<T>) -> Self {
        Self {
            pool: InMemoryPool::new(),
            lister,
            key_fn,
            relist: None,
        }
    }

    fn clone_inner(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            lister: self.lister.clone(),
            key_fn: self.key_fn.clone(),
            relist: None,
        }
    }

    /// List the cloud and add every recognized object.
    pub async fn replenish(&self) {
        debug!("Replenishing cloud listing pool");
        let items = match self.lister.list().await {
            Ok(items) => items,
            Err(e) => {
                warn!("Failed to list: {}", e);
                return;
            }
        };
        for item in items {
            match (self.key_fn)(&item) {
                Ok(key) => {
                    if self.pool.get(&key).await.is_none() {
                        info!("Adding {} to the pool from a cloud listing", key);
                    }
                    self.pool.add(&key, item).await;
                }
                Err(e) => debug!("Skipping listed object: {}", e),
            }
        }
    }
}

impl<T> Drop for CloudListingPool<T> {
    fn drop(&mut self) {
        if let Some(relist) = self.relist.take() {
            relist.abort();
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Snapshotter<T> for CloudListingPool<T> {
    async fn snapshot(&self) -> HashMap<String, T> {
        self.pool.snapshot().await
    }

    async fn get(&self, key: &str) -> Option<T> {
        self.pool.get(key).await
    }

    async fn add(&self, key: &str, obj: T) {
        self.pool.add(key, obj).await
    }

    async fn delete(&self, key: &str) {
        self.pool.delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;

    struct StaticLister {
        items: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CloudLister<String> for StaticLister {
        async fn list(&self) -> Result<Vec<String>> {
            Ok(self.items.lock().unwrap().clone())
        }
    }

    fn key_fn() -> KeyFunc<String> {
        Arc::new(|s: &String| {
            s.strip_prefix("k8s-")
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidName(s.clone()))
        })
    }

    #[tokio::test]
    async fn test_in_memory_pool() {
        let pool = InMemoryPool::new();
        pool.add("a", 1).await;
        pool.add("b", 2).await;
        assert_eq!(pool.get("a").await, Some(1));
        pool.delete("a").await;
        assert_eq!(pool.get("a").await, None);
        assert_eq!(pool.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_replenish_is_additive() {
        let lister = Arc::new(StaticLister {
            items: Mutex::new(vec!["k8s-a".to_string(), "other".to_string()]),
        });
        let pool = CloudListingPool::without_relist(lister.clone(), key_fn());
        pool.add("mine", "mine".to_string()).await;

        pool.replenish().await;
        let snap = pool.snapshot().await;
        assert!(snap.contains_key("a"));
        assert!(snap.contains_key("mine"));
        assert!(!snap.contains_key("other"));

        // Gone from the cloud but still tracked until deleted explicitly.
        lister.items.lock().unwrap().clear();
        pool.replenish().await;
        assert!(pool.get("a").await.is_some());
        pool.delete("a").await;
        assert!(pool.get("a").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_relist() {
        let lister = Arc::new(StaticLister {
            items: Mutex::new(vec![]),
        });
        let pool = CloudListingPool::new(lister.clone(), key_fn(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(pool.snapshot().await.is_empty());

        lister.items.lock().unwrap().push("k8s-late".to_string());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(pool.get("late").await.is_some());
    }
}
