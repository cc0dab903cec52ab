use clap::Parser;
use index_engine::IndexEngine;
use std::path::PathBuf;
use std::sync::Arc;
use store::{IndexStore, MemoryStore};
use trainer::{FileRowSource, Trainer};

/// Replays a warehouse export of `(item, users)` rows into a fresh index.
#[derive(Parser)]
struct Args {
    /// Newline-delimited JSON file of `{"item": .., "users": ..}` rows.
    #[arg(long, env = "REPOSIM_TRAIN_INPUT")]
    input: PathBuf,

    #[arg(long, env = "REPOSIM_BANDS", default_value_t = 128)]
    bands: usize,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let store: Arc<dyn IndexStore> = MemoryStore::new();
    let engine = IndexEngine::new(store, args.bands);
    let trainer = Trainer::new(engine);

    let source = FileRowSource::open(&args.input).await?;
    let report = trainer.train(source).await?;
    tracing::info!(rows_applied = report.rows_applied, "training run complete");
    Ok(())
}
