use broker::{Broker, CrawlTarget};
use clap::Parser;
use crawler::{Crawler, CrawlerConfig, GithubQuotaSource, ReqwestGithubClient};
use credentials::CredentialPool;
use docstore::{FileErrorSink, MemoryDocumentSink};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::{MemoryStore, MessageQueue};
use url::Url;

/// Standalone crawl worker: drains a broker of crawl targets against the
/// GitHub GraphQL API until interrupted.
#[derive(Parser)]
struct Args {
    /// File of one API token per line.
    #[arg(long, env = "REPOSIM_CREDENTIALS_FILE")]
    credentials_file: PathBuf,

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

    /// Optional file of `owner/name` lines to seed the queue with at startup.
    #[arg(long, env = "REPOSIM_SEED_FILE")]
    seed_file: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let keys = read_lines(&args.credentials_file).await?;
    let quota_source = Arc::new(GithubQuotaSource::new(args.github_graphql_url.clone()));
    let pool = Arc::new(CredentialPool::bootstrap(keys, quota_source).await?);

    let backing = MemoryStore::new();
    let queue: Arc<dyn MessageQueue> = backing.clone();
    let broker = Arc::new(Broker::new(queue, "repository"));

    if let Some(seed_file) = &args.seed_file {
        for line in read_lines(seed_file).await? {
            let Some((owner, name)) = line.split_once('/') else {
                tracing::warn!(line, "skipping malformed seed line, expected owner/name");
                continue;
            };
            broker
                .enqueue(&CrawlTarget {
                    owner: owner.to_string(),
                    name: name.to_string(),
                })
                .await?;
        }
    }

    let crawler = Arc::new(Crawler::new(
        broker,
        pool,
        Arc::new(ReqwestGithubClient::new(args.github_graphql_url.clone())),
        Arc::new(MemoryDocumentSink::new()),
        Arc::new(FileErrorSink::new(args.error_log)),
        CrawlerConfig {
            max_concurrent: args.max_concurrent,
            batch_size: args.batch_size,
            sleep_interval: Duration::from_secs(args.sleep_interval_secs),
            ..CrawlerConfig::default()
        },
    ));

    tokio::select! {
        _ = crawler.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }
    Ok(())
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
