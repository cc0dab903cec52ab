//! FIFO work queue of crawl targets, built atop the [`store::MessageQueue`]
//! list operations. Producers push, a consumer pops; there is no
//! redelivery/ack protocol, so once a message is dequeued it is the
//! consumer's responsibility to requeue it on transient failure.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use store::{MessageQueue, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("malformed broker message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A pending GitHub repository to crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTarget {
    pub owner: String,
    pub name: String,
}

/// A named FIFO queue of [`CrawlTarget`] messages.
pub struct Broker {
    queue: Arc<dyn MessageQueue>,
    topic: String,
}

impl Broker {
    pub fn new(queue: Arc<dyn MessageQueue>, topic: impl Into<String>) -> Self {
        Self {
            queue,
            topic: topic.into(),
        }
    }

    /// Enqueues a crawl target. Used both for fresh work and for requeuing a
    /// target that failed transiently — both land at the same head position.
    pub async fn enqueue(&self, target: &CrawlTarget) -> Result<(), BrokerError> {
        let encoded = serde_json::to_vec(target)?;
        self.queue.lpush(&self.topic, Bytes::from(encoded)).await?;
        Ok(())
    }

    /// Dequeues the oldest pending target, if any.
    pub async fn dequeue(&self) -> Result<Option<CrawlTarget>, BrokerError> {
        match self.queue.rpop(&self.topic).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Dequeues up to `n` targets, returning short as soon as the queue
    /// drains rather than waiting for more to arrive.
    pub async fn dequeue_bulk(&self, n: usize) -> Result<Vec<CrawlTarget>, BrokerError> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.dequeue().await? {
                Some(target) => out.push(target),
                None => break,
            }
        }
        Ok(out)
    }

    pub async fn is_empty(&self) -> Result<bool, BrokerError> {
        Ok(self.queue.llen(&self.topic).await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::MemoryStore;

    #[tokio::test]
    async fn fifo_order_is_preserved_absent_requeues() {
        let broker = Broker::new(MemoryStore::new(), "repository");
        for i in 0..5 {
            broker
                .enqueue(&CrawlTarget {
                    owner: "acme".into(),
                    name: format!("repo-{i}"),
                })
                .await
                .unwrap();
        }

        let got = broker.dequeue_bulk(5).await.unwrap();
        let names: Vec<_> = got.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["repo-0", "repo-1", "repo-2", "repo-3", "repo-4"]);
    }

    #[tokio::test]
    async fn dequeue_bulk_returns_short_when_queue_drains() {
        let broker = Broker::new(MemoryStore::new(), "repository");
        broker
            .enqueue(&CrawlTarget {
                owner: "acme".into(),
                name: "only".into(),
            })
            .await
            .unwrap();

        let got = broker.dequeue_bulk(10).await.unwrap();
        assert_eq!(got.len(), 1);
        assert!(broker.is_empty().await.unwrap());
    }
}
