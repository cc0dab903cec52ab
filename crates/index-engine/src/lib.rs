//! Online MinHash index maintenance: reads an item's current sketch,
//! computes the differential against a new observation, and writes the
//! posting-list mutations and updated sketch. This is the hottest path in
//! the system, so write volume is kept proportional to the number of bands
//! that actually change rather than the full signature width.

use bytes::Bytes;
use sketch::UserId;
use std::collections::HashMap;
use std::sync::Arc;
use store::IndexStore;

/// A recommendable entity — a GitHub repository in this deployment, but the
/// engine itself is agnostic to what an item represents.
pub type ItemId = u64;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("updateItem requires at least one user")]
    InvalidInput,
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),
    #[error("codec error: {0}")]
    Codec(#[from] codec::CodecError),
}

fn posting_key(band: usize, value: u64) -> String {
    format!("sig{band}-{value}")
}

/// Owns all mutation of item sketches and their posting-list secondary
/// index. Not safe for concurrent writers targeting the same item — see the
/// crate-level docs on intended per-item serialization.
pub struct IndexEngine {
    store: Arc<dyn IndexStore>,
    bands: usize,
}

impl IndexEngine {
    pub fn new(store: Arc<dyn IndexStore>, bands: usize) -> Self {
        Self { store, bands }
    }

    /// Folds a new `(item, users)` observation into the index.
    pub async fn update_item(&self, item: ItemId, users: &[UserId]) -> Result<(), EngineError> {
        if users.is_empty() {
            return Err(EngineError::InvalidInput);
        }
        let observed = sketch::minhash_union(users.iter().copied(), self.bands)
            .map_err(|_| EngineError::InvalidInput)?;

        let item_key = item.to_string();
        match self.store.get(&item_key).await? {
            None => self.insert_new_item(item, &item_key, &observed).await,
            Some(bytes) => {
                let old = codec::decode(&bytes)?;
                self.merge_existing_item(item, &item_key, &old, &observed)
                    .await
            }
        }
    }

    /// First observation of `item`: the signature is simply `U`, and every
    /// band's posting list gains `item`.
    async fn insert_new_item(
        &self,
        item: ItemId,
        item_key: &str,
        observed: &[u64],
    ) -> Result<(), EngineError> {
        let posting_keys: Vec<String> = (0..self.bands)
            .map(|b| posting_key(b, observed[b]))
            .collect();
        let existing = self.store.mget(&posting_keys).await?;

        let mut mutation = HashMap::with_capacity(self.bands + 1);
        for (key, bytes) in posting_keys.iter().zip(existing) {
            let mut list = match bytes {
                Some(b) => codec::decode(&b)?,
                None => Vec::new(),
            };
            if !list.contains(&item) {
                list.push(item);
            }
            mutation.insert(key.clone(), Bytes::from(codec::encode(&list)?));
        }
        mutation.insert(item_key.to_string(), Bytes::from(codec::encode(observed)?));

        self.store.mset(mutation).await?;
        Ok(())
    }

    /// A repeat observation of `item`: only bands where the sketch strictly
    /// improves need their posting lists moved.
    async fn merge_existing_item(
        &self,
        item: ItemId,
        item_key: &str,
        old: &[u64],
        observed: &[u64],
    ) -> Result<(), EngineError> {
        let d = sketch::diff(old, observed);
        if d.is_empty() {
            // old already dominates observed bandwise: no index change.
            return Ok(());
        }

        let remove_keys: Vec<String> = d
            .bands
            .iter()
            .zip(&d.old_vals)
            .map(|(&b, &v)| posting_key(b, v))
            .collect();
        let append_keys: Vec<String> = d
            .bands
            .iter()
            .zip(&d.new_vals)
            .map(|(&b, &v)| posting_key(b, v))
            .collect();

        let mut all_keys = remove_keys.clone();
        all_keys.extend(append_keys.iter().cloned());
        let fetched = self.store.mget(&all_keys).await?;
        let (remove_values, append_values) = fetched.split_at(remove_keys.len());

        let mut to_delete = Vec::new();
        let mut mutation = HashMap::new();

        for (key, bytes) in remove_keys.iter().zip(remove_values) {
            let Some(bytes) = bytes else {
                // List already absent: nothing to remove, tolerates repeats.
                continue;
            };
            let mut list = codec::decode(bytes)?;
            let Some(pos) = list.iter().position(|&x| x == item) else {
                continue;
            };
            list.remove(pos);
            if list.is_empty() {
                to_delete.push(key.clone());
            } else {
                mutation.insert(key.clone(), Bytes::from(codec::encode(&list)?));
            }
        }

        for (key, bytes) in append_keys.iter().zip(append_values) {
            let mut list = match bytes {
                Some(b) => codec::decode(b)?,
                None => Vec::new(),
            };
            if !list.contains(&item) {
                list.push(item);
            }
            mutation.insert(key.clone(), Bytes::from(codec::encode(&list)?));
        }

        let mut new_sketch = old.to_vec();
        for (i, &b) in d.bands.iter().enumerate() {
            new_sketch[b] = d.new_vals[i];
        }
        mutation.insert(item_key.to_string(), Bytes::from(codec::encode(&new_sketch)?));

        // Delete before mset: a crash here leaves stale posting entries
        // (a superset of the truth), never a missing entry.
        self.store.delete(&to_delete).await?;
        self.store.mset(mutation).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::MemoryStore;

    async fn posting_list(store: &Arc<dyn IndexStore>, band: usize, value: u64) -> Vec<u64> {
        match store.get(&posting_key(band, value)).await.unwrap() {
            Some(bytes) => codec::decode(&bytes).unwrap(),
            None => Vec::new(),
        }
    }

    #[tokio::test]
    async fn scenario_s1_new_item_populates_every_band() {
        let store: Arc<dyn IndexStore> = MemoryStore::new();
        let engine = IndexEngine::new(store.clone(), 4);
        engine.update_item(100, &[42]).await.unwrap();

        let expected = sketch::minhash(42, 4);
        let stored = codec::decode(&store.get("100").await.unwrap().unwrap()).unwrap();
        assert_eq!(stored, expected);

        for b in 0..4 {
            assert_eq!(posting_list(&store, b, expected[b]).await, vec![100]);
        }
    }

    #[tokio::test]
    async fn scenario_s2_merge_moves_only_improved_bands() {
        let store: Arc<dyn IndexStore> = MemoryStore::new();
        let engine = IndexEngine::new(store.clone(), 4);
        engine.update_item(100, &[42]).await.unwrap();
        engine.update_item(100, &[7]).await.unwrap();

        let m42 = sketch::minhash(42, 4);
        let m7 = sketch::minhash(7, 4);
        let merged = codec::decode(&store.get("100").await.unwrap().unwrap()).unwrap();

        for b in 0..4 {
            assert_eq!(merged[b], m42[b].min(m7[b]));
            if m42[b] > m7[b] {
                assert!(!posting_list(&store, b, m42[b]).await.contains(&100));
                assert_eq!(posting_list(&store, b, m7[b]).await, vec![100]);
            } else {
                assert_eq!(posting_list(&store, b, m42[b]).await, vec![100]);
            }
        }
    }

    #[tokio::test]
    async fn update_item_is_idempotent() {
        let store: Arc<dyn IndexStore> = MemoryStore::new();
        let engine = IndexEngine::new(store.clone(), 8);
        engine.update_item(1, &[1, 2, 3]).await.unwrap();
        let after_first = codec::decode(&store.get("1").await.unwrap().unwrap()).unwrap();

        engine.update_item(1, &[1, 2, 3]).await.unwrap();
        let after_second = codec::decode(&store.get("1").await.unwrap().unwrap()).unwrap();
        assert_eq!(after_first, after_second);

        for b in 0..8 {
            assert_eq!(posting_list(&store, b, after_first[b]).await, vec![1]);
        }
    }

    #[tokio::test]
    async fn posting_list_never_keeps_a_duplicate_on_repeated_insert_retry() {
        let store: Arc<dyn IndexStore> = MemoryStore::new();
        let engine = IndexEngine::new(store.clone(), 4);
        // Simulates a crash-retry of the new-item branch: the posting lists
        // already contain the item from a prior partial write.
        engine.update_item(5, &[9]).await.unwrap();
        engine.update_item(5, &[9]).await.unwrap();

        let sig = sketch::minhash(9, 4);
        for b in 0..4 {
            assert_eq!(posting_list(&store, b, sig[b]).await, vec![5]);
        }
    }

    #[tokio::test]
    async fn empty_user_set_is_rejected() {
        let store: Arc<dyn IndexStore> = MemoryStore::new();
        let engine = IndexEngine::new(store, 4);
        let err = engine.update_item(1, &[]).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput));
    }

    #[tokio::test]
    async fn vacated_posting_list_is_deleted_not_left_empty() {
        let store: Arc<dyn IndexStore> = MemoryStore::new();
        let engine = IndexEngine::new(store.clone(), 4);
        engine.update_item(1, &[42]).await.unwrap();
        let m42 = sketch::minhash(42, 4);
        let m7 = sketch::minhash(7, 4);

        engine.update_item(1, &[7]).await.unwrap();

        for b in 0..4 {
            if m42[b] > m7[b] {
                assert!(store.get(&posting_key(b, m42[b])).await.unwrap().is_none());
            }
        }
    }
}
