// Run one fetch cycle against the configured sources and log the report.
//
//   cargo run --bin fetch_once
//   SOURCES_PATH=config/sources.toml FETCHER_WORKERS=10 cargo run --bin fetch_once

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use cryptosignal_news::{
    config::AppConfig,
    ingest::{
        feed::{ArticleOptions, FeedFetcher, HttpFeedRetriever},
        FetchOrchestrator,
    },
    init_tracing,
    sources::SourceRegistry,
    storage::{MemoryStorage, Storage},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::from_env().context("loading configuration")?;
    let registry = SourceRegistry::load_or_seed(&cfg.sources_path)?;

    let storage = Arc::new(MemoryStorage::from_registry(&registry));
    let retriever = HttpFeedRetriever::new().context("building feed http client")?;
    let fetcher = FeedFetcher::new(
        Arc::new(retriever),
        cfg.fetch.timeout,
        ArticleOptions {
            max_age: cfg.fetch.max_age,
            target_language: Some(cfg.translation.target_language.clone()),
        },
    );
    let orchestrator = FetchOrchestrator::new(
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::new(fetcher),
        cfg.fetch.workers,
        cfg.fetch.timeout,
    );

    // Ctrl-C cancels in-flight fetches; the partial report is still printed.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let report = orchestrator.fetch_all(&cancel).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    for a in storage.recent_articles(10).await? {
        println!(
            "[{}] {} {:?}{}",
            a.pub_date.format("%Y-%m-%d %H:%M"),
            a.title,
            a.coins,
            if a.is_breaking { " BREAKING" } else { "" }
        );
    }
    Ok(())
}
