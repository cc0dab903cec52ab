//! The durable document store and append-only error sink the crawler writes
//! into. Both are treated as external collaborators: this crate only fixes
//! the capability interfaces and provides in-process implementations that
//! are useful for tests and small deployments.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum DocStoreError {
    #[error("document is missing a primary-key 'id' field")]
    MissingId,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize document: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn doc_id(doc: &Value) -> Result<String, DocStoreError> {
    match doc.get("id") {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(DocStoreError::MissingId),
    }
}

/// Upsert-by-id sink for crawled repository documents.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn put(&self, doc: Value) -> Result<(), DocStoreError>;
}

/// Append-only sink for permanent crawl failures (GraphQL `errors`, missing
/// `data.repository`). Never requeued, so this is the only record of them.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn record(&self, entry: Value) -> Result<(), DocStoreError>;
}

/// In-memory document sink, replacing by id. Useful for tests and for
/// embedding the index engine and crawler in a single process.
#[derive(Default)]
pub struct MemoryDocumentSink {
    docs: Mutex<HashMap<String, Value>>,
}

impl MemoryDocumentSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<Value> {
        self.docs.lock().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.docs.lock().await.len()
    }
}

#[async_trait]
impl DocumentSink for MemoryDocumentSink {
    async fn put(&self, doc: Value) -> Result<(), DocStoreError> {
        let id = doc_id(&doc)?;
        self.docs.lock().await.insert(id, doc);
        Ok(())
    }
}

/// Append-only, newline-delimited JSON file sink. Matches the crawler's
/// error-log shape: every record is appended once and never rewritten.
pub struct FileErrorSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileErrorSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl ErrorSink for FileErrorSink {
    async fn record(&self, entry: Value) -> Result<(), DocStoreError> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_sink_upserts_by_id() {
        let sink = MemoryDocumentSink::new();
        sink.put(json!({"id": "1", "name": "first"})).await.unwrap();
        sink.put(json!({"id": "1", "name": "renamed"})).await.unwrap();
        assert_eq!(sink.len().await, 1);
        assert_eq!(sink.get("1").await.unwrap()["name"], "renamed");
    }

    #[tokio::test]
    async fn memory_sink_rejects_missing_id() {
        let sink = MemoryDocumentSink::new();
        let err = sink.put(json!({"name": "no id"})).await.unwrap_err();
        assert!(matches!(err, DocStoreError::MissingId));
    }

    #[tokio::test]
    async fn file_sink_appends_one_line_per_record() {
        let dir = std::env::temp_dir().join(format!("docstore-test-{}", std::process::id()));
        let path = dir.join("errors.log");
        let sink = FileErrorSink::new(&path);
        sink.record(json!({"error": "boom"})).await.unwrap();
        sink.record(json!({"error": "boom again"})).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
