use clap::Parser;
use crawler::{Crawler, CrawlerConfig, GithubQuotaSource, ReqwestGithubClient};
use credentials::CredentialPool;
use docstore::{FileErrorSink, MemoryDocumentSink};
use index_engine::IndexEngine;
use query::Query;
use server::{router, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::{IndexStore, MemoryStore, MessageQueue};
use url::Url;

/// Serves repository recommendations over HTTP, and optionally runs an
/// embedded crawl worker when credentials are configured.
#[derive(Parser)]
struct Args {
    #[arg(long, env = "REPOSIM_BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: SocketAddr,

    #[arg(long, env = "REPOSIM_BANDS", default_value_t = 128)]
    bands: usize,

    /// File of one GitHub API token per line. Omit to run query-only,
    /// without the embedded crawler.
    #[arg(long, env = "REPOSIM_CREDENTIALS_FILE")]
    credentials_file: Option<PathBuf>,

    #[arg(long, env = "REPOSIM_GITHUB_GRAPHQL_URL", default_value = "https://api.github.com/graphql")]
    github_graphql_url: Url,

    #[arg(long, env = "REPOSIM_ERROR_LOG", default_value = "./crawl-errors.jsonl")]
    error_log: PathBuf,

    #[arg(long, env = "REPOSIM_MAX_CONCURRENT", default_value_t = 10)]
    max_concurrent: usize,

    #[arg(long, env = "REPOSIM_BATCH_SIZE", default_value_t = 100)]
    batch_size: usize,

    #[arg(long, env = "REPOSIM_SLEEP_INTERVAL_SECS", default_value_t = 10)]
    sleep_interval_secs: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let backing = MemoryStore::new();
    let index_store: Arc<dyn IndexStore> = backing.clone();

    let engine = Arc::new(IndexEngine::new(index_store.clone(), args.bands));
    let query = Arc::new(Query::new(index_store, args.bands));

    if let Some(credentials_file) = &args.credentials_file {
        let keys = read_lines(credentials_file).await?;
        let quota_source = Arc::new(GithubQuotaSource::new(args.github_graphql_url.clone()));
        let pool = Arc::new(CredentialPool::bootstrap(keys, quota_source).await?);

        let queue: Arc<dyn MessageQueue> = backing.clone();
        let broker = Arc::new(broker::Broker::new(queue, "repository"));
        let crawler = Arc::new(Crawler::new(
            broker,
            pool,
            Arc::new(ReqwestGithubClient::new(args.github_graphql_url.clone())),
            Arc::new(MemoryDocumentSink::new()),
            Arc::new(FileErrorSink::new(args.error_log.clone())),
            CrawlerConfig {
                max_concurrent: args.max_concurrent,
                batch_size: args.batch_size,
                sleep_interval: Duration::from_secs(args.sleep_interval_secs),
                ..CrawlerConfig::default()
            },
        ));
        tokio::spawn(crawler.run());
    } else {
        tracing::warn!("no credentials file configured, embedded crawler is disabled");
    }

    let app = router(AppState { query, engine });
    let listener = tokio::net::TcpListener::bind(args.bind_addr).await?;
    tracing::info!(addr = %args.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl_c handler");
    tracing::info!("shutdown signal received, draining in-flight requests");
}

async fn read_lines(path: &PathBuf) -> anyhow::Result<Vec<String>> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}
