//! Drives [`index_engine::IndexEngine`] from a stream of `(item, users)`
//! observations pulled from an external warehouse source. Transient read
//! errors are retried with backoff; the row index of the last successful
//! update is tracked so a restart resumes rather than reprocessing from
//! scratch.

use exponential_backoff::Backoff;
use index_engine::{EngineError, IndexEngine, ItemId};
use sketch::UserId;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("transient read error: {0}")]
    Transient(String),
    #[error("fatal read error: {0}")]
    Fatal(String),
}

/// One observation: an item and the set of users associated with it in this
/// batch. Mirrors the warehouse row shape, where `users` may arrive as a
/// single id or a list.
#[derive(Debug, Clone)]
pub struct Row {
    pub item: ItemId,
    pub users: Vec<UserId>,
}

/// An external row source, e.g. a paginated warehouse query. `next` returns
/// `Ok(None)` once exhausted; the trainer treats that as a clean stop, never
/// an error.
#[async_trait::async_trait]
pub trait RowSource: Send + Sync {
    async fn next(&mut self) -> Result<Option<Row>, SourceError>;
}

const MAX_RETRIES: u32 = 5;
const BASE_DELAY: Duration = Duration::from_secs(3);
const MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    #[error("row source exhausted its retries: {0}")]
    SourceExhausted(String),
    #[error("row source reported a fatal error: {0}")]
    SourceFatal(String),
    #[error("index engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Reports how far a training run got, so a caller can log or checkpoint
/// the position a restart should resume from.
#[derive(Debug, Default)]
pub struct TrainingReport {
    pub rows_applied: usize,
}

/// A [`RowSource`] over a newline-delimited JSON file, the reference
/// implementation used by the `trainer` binary. Each line is
/// `{"item": <id>, "users": <id> | [<id>, ...]}`; a malformed line is a
/// fatal error rather than transient, since a file does not get better on
/// retry.
pub struct FileRowSource {
    lines: tokio::io::Lines<tokio::io::BufReader<tokio::fs::File>>,
}

impl FileRowSource {
    pub async fn open(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self {
            lines: tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(file)),
        })
    }
}

#[derive(serde::Deserialize)]
struct RawRow {
    item: ItemId,
    users: serde_json::Value,
}

#[async_trait::async_trait]
impl RowSource for FileRowSource {
    async fn next(&mut self) -> Result<Option<Row>, SourceError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| SourceError::Fatal(e.to_string()))?;
            let Some(line) = line else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            let raw: RawRow =
                serde_json::from_str(&line).map_err(|e| SourceError::Fatal(e.to_string()))?;
            let users = match raw.users {
                serde_json::Value::Number(n) => vec![n
                    .as_i64()
                    .ok_or_else(|| SourceError::Fatal("users field is not an integer".into()))?],
                serde_json::Value::Array(items) => items
                    .into_iter()
                    .map(|v| {
                        v.as_i64()
                            .ok_or_else(|| SourceError::Fatal("users array element is not an integer".into()))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                _ => {
                    return Err(SourceError::Fatal(
                        "users field must be an integer or a list of integers".into(),
                    ))
                }
            };
            return Ok(Some(Row { item: raw.item, users }));
        }
    }
}

pub struct Trainer {
    engine: IndexEngine,
}

impl Trainer {
    pub fn new(engine: IndexEngine) -> Self {
        Self { engine }
    }

    /// Consumes `source` until it is exhausted, applying every row to the
    /// index. A transient read error is retried up to [`MAX_RETRIES`] times
    /// with exponential backoff before the run gives up; a fatal read error
    /// stops the run immediately. Either way, `rows_applied` on the returned
    /// report (or carried by the error, for a caller that wants to resume)
    /// reflects the last successfully applied row.
    pub async fn train(&self, mut source: impl RowSource) -> Result<TrainingReport, TrainerError> {
        let mut report = TrainingReport::default();
        let backoff = Backoff::new(MAX_RETRIES, BASE_DELAY, MAX_DELAY);
        let mut retries = backoff.iter();

        loop {
            match source.next().await {
                Ok(None) => return Ok(report),
                Ok(Some(row)) => {
                    self.engine.update_item(row.item, &row.users).await?;
                    report.rows_applied += 1;
                    // A successful row resets the retry budget: only
                    // consecutive failures should exhaust it.
                    retries = backoff.iter();
                }
                Err(SourceError::Fatal(message)) => {
                    tracing::error!(rows_applied = report.rows_applied, %message, "row source reported a fatal error");
                    return Err(TrainerError::SourceFatal(message));
                }
                Err(SourceError::Transient(message)) => match retries.next() {
                    Some(delay) => {
                        tracing::warn!(rows_applied = report.rows_applied, %message, ?delay, "transient read error, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    _ => {
                        tracing::error!(rows_applied = report.rows_applied, %message, "row source exhausted retries");
                        return Err(TrainerError::SourceExhausted(message));
                    }
                },
            }
        }
    }
}
