//! The abstract KV substrate shared by the index engine and the crawl
//! broker: opaque byte keys and values, with no cross-key transactionality.
//! Callers (see `index-engine`) are responsible for ordering their writes so
//! that a crash between [`IndexStore::delete`] and [`IndexStore::mset`]
//! leaves a superset of the correct state rather than a missing entry.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Capability set over opaque byte keys/values. Implementations need only
/// guarantee per-key atomicity of `mset`/`delete`, not atomicity across keys.
#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Fetches multiple keys in one round trip, preserving input order.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, StoreError>;

    /// Writes every entry in `entries`. Per-key atomic; not atomic as a batch.
    async fn mset(&self, entries: HashMap<String, Bytes>) -> Result<(), StoreError>;

    /// Removes every key in `keys`. Idempotent: missing keys are not an error.
    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;
}

/// The list-backed capability the broker uses for its FIFO queue. Kept
/// distinct from [`IndexStore`] per the design note that broker and index
/// concerns should not share one interface just because they share a backend.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn lpush(&self, queue: &str, value: Bytes) -> Result<(), StoreError>;
    async fn rpop(&self, queue: &str) -> Result<Option<Bytes>, StoreError>;
    async fn llen(&self, queue: &str) -> Result<usize, StoreError>;
}

/// An in-process backend implementing both capabilities, suitable for tests
/// and for small single-node deployments. A production deployment would
/// swap this for a networked KV store behind the same two traits.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Bytes>>,
    lists: RwLock<HashMap<String, VecDeque<Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, StoreError> {
        let values = self.values.read().await;
        Ok(keys.iter().map(|k| values.get(k).cloned()).collect())
    }

    async fn mset(&self, entries: HashMap<String, Bytes>) -> Result<(), StoreError> {
        let mut values = self.values.write().await;
        for (k, v) in entries {
            values.insert(k, v);
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut values = self.values.write().await;
        for k in keys {
            values.remove(k);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for MemoryStore {
    async fn lpush(&self, queue: &str, value: Bytes) -> Result<(), StoreError> {
        self.lists
            .write()
            .await
            .entry(queue.to_string())
            .or_default()
            .push_front(value);
        Ok(())
    }

    async fn rpop(&self, queue: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self
            .lists
            .write()
            .await
            .get_mut(queue)
            .and_then(|list| list.pop_back()))
    }

    async fn llen(&self, queue: &str) -> Result<usize, StoreError> {
        Ok(self
            .lists
            .read()
            .await
            .get(queue)
            .map(|list| list.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mset_mget_delete_round_trip() {
        let store = MemoryStore::new();
        let mut entries = HashMap::new();
        entries.insert("a".to_string(), Bytes::from_static(b"1"));
        entries.insert("b".to_string(), Bytes::from_static(b"2"));
        store.mset(entries).await.unwrap();

        let got = store
            .mget(&["a".to_string(), "missing".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(got[0], Some(Bytes::from_static(b"1")));
        assert_eq!(got[1], None);
        assert_eq!(got[2], Some(Bytes::from_static(b"2")));

        store.delete(&["a".to_string()]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let store = MemoryStore::new();
        store.lpush("q", Bytes::from_static(b"first")).await.unwrap();
        store.lpush("q", Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(store.llen("q").await.unwrap(), 2);
        assert_eq!(store.rpop("q").await.unwrap(), Some(Bytes::from_static(b"first")));
        assert_eq!(store.rpop("q").await.unwrap(), Some(Bytes::from_static(b"second")));
        assert_eq!(store.rpop("q").await.unwrap(), None);
    }
}
