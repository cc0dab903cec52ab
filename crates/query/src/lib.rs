//! Top-k similar-item retrieval: collides a query item's signature bands
//! against the secondary index and ranks candidates by collision count, an
//! unbiased proxy for Jaccard similarity between their user sets.

use index_engine::ItemId;
use std::collections::HashMap;
use std::sync::Arc;
use store::IndexStore;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("no item found with id {0}")]
    NotFound(ItemId),
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),
    #[error("codec error: {0}")]
    Codec(#[from] codec::CodecError),
}

/// Read-only client over the index store. Never mutates `S[i]` or `L[b, v]`.
pub struct Query {
    store: Arc<dyn IndexStore>,
    bands: usize,
}

impl Query {
    pub fn new(store: Arc<dyn IndexStore>, bands: usize) -> Self {
        Self { store, bands }
    }

    /// Returns up to `k` items most similar to `item`, excluding itself.
    pub async fn recommend(&self, item: ItemId, k: usize) -> Result<Vec<ItemId>, QueryError> {
        let sig_bytes = self
            .store
            .get(&item.to_string())
            .await?
            .ok_or(QueryError::NotFound(item))?;
        let sig = codec::decode(&sig_bytes)?;

        let posting_keys: Vec<String> = (0..self.bands.min(sig.len()))
            .map(|b| format!("sig{b}-{}", sig[b]))
            .collect();
        let fetched = self.store.mget(&posting_keys).await?;

        let mut counts: HashMap<ItemId, u64> = HashMap::new();
        for bytes in fetched.into_iter().flatten() {
            let list = codec::decode(&bytes)?;
            for id in list {
                *counts.entry(id).or_insert(0) += 1;
            }
        }

        // Stable by count descending, then by id ascending, so ties are
        // broken deterministically rather than by hash-map iteration order.
        let mut ranked: Vec<(ItemId, u64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        // The query item collides with itself on every one of its own
        // bands, so it has the highest count and sorts first.
        if ranked.first().map(|&(id, _)| id) == Some(item) {
            ranked.remove(0);
        } else {
            ranked.retain(|&(id, _)| id != item);
        }

        Ok(ranked.into_iter().take(k).map(|(id, _)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap as Map;
    use store::MemoryStore;

    async fn put_sig(store: &Arc<dyn IndexStore>, item: ItemId, sig: &[u64]) {
        let mut m = Map::new();
        m.insert(item.to_string(), Bytes::from(codec::encode(sig).unwrap()));
        store.mset(m).await.unwrap();
    }

    async fn put_posting(store: &Arc<dyn IndexStore>, band: usize, value: u64, members: &[u64]) {
        let mut m = Map::new();
        m.insert(
            format!("sig{band}-{value}"),
            Bytes::from(codec::encode(members).unwrap()),
        );
        store.mset(m).await.unwrap();
    }

    #[tokio::test]
    async fn scenario_s3_ranks_by_collision_count_and_excludes_self() {
        let store: Arc<dyn IndexStore> = MemoryStore::new();

        // item 1 and item 3 share bands 0 and 1; item 2 and item 3 share
        // band 2 only. Items 4 and 5 are disjoint from all of this.
        put_sig(&store, 1, &[10, 20, 30]).await;
        put_sig(&store, 2, &[11, 21, 31]).await;
        put_sig(&store, 3, &[10, 20, 31]).await;
        put_sig(&store, 4, &[40, 41, 42]).await;
        put_sig(&store, 5, &[50, 51, 52]).await;

        put_posting(&store, 0, 10, &[1, 3]).await;
        put_posting(&store, 1, 20, &[1, 3]).await;
        put_posting(&store, 2, 30, &[1]).await;
        put_posting(&store, 0, 11, &[2]).await;
        put_posting(&store, 1, 21, &[2]).await;
        put_posting(&store, 2, 31, &[2, 3]).await;

        let query = Query::new(store, 3);
        let top = query.recommend(3, 2).await.unwrap();
        assert_eq!(top, vec![1, 2]);
    }

    #[tokio::test]
    async fn recommend_never_includes_the_query_item() {
        let store: Arc<dyn IndexStore> = MemoryStore::new();
        put_sig(&store, 9, &[1, 2]).await;
        put_posting(&store, 0, 1, &[9]).await;
        put_posting(&store, 1, 2, &[9]).await;

        let query = Query::new(store, 2);
        let top = query.recommend(9, 5).await.unwrap();
        assert!(top.is_empty());
    }

    #[tokio::test]
    async fn recommend_unknown_item_is_not_found() {
        let store: Arc<dyn IndexStore> = MemoryStore::new();
        let query = Query::new(store, 4);
        let err = query.recommend(123, 5).await.unwrap_err();
        assert!(matches!(err, QueryError::NotFound(123)));
    }
}
