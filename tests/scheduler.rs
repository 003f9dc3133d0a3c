// tests/scheduler.rs
//
// Scheduler lifecycle on paused time: immediate first cycle, ticks,
// single-instance start, stop, interval changes and stats.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use cryptosignal_news::ingest::scheduler::{Scheduler, STOP_GRACE};
use cryptosignal_news::ingest::types::{FeedError, SourceFetcher};
use cryptosignal_news::ingest::FetchOrchestrator;
use cryptosignal_news::models::{Article, Source, TranslationStatus};
use cryptosignal_news::sources::FeedSource;
use cryptosignal_news::storage::{MemoryStorage, Storage, StorageError};

const INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct CountingFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl SourceFetcher for CountingFetcher {
    async fn fetch_source(&self, _source: &dyn FeedSource) -> Result<Vec<Article>, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

fn one_source() -> Source {
    Source {
        id: 1,
        key: "only".into(),
        name: "Only".into(),
        url: "https://only.test/rss".into(),
        category: "general".into(),
        language: "en".into(),
        enabled: true,
        reliability: 0.5,
        last_fetched_at: None,
        error_count: 0,
    }
}

fn scheduler(interval: Duration) -> (Arc<Scheduler>, Arc<CountingFetcher>) {
    let fetcher = Arc::new(CountingFetcher::default());
    let storage = Arc::new(MemoryStorage::with_sources(vec![one_source()]));
    let orch = FetchOrchestrator::new(
        storage,
        Arc::clone(&fetcher) as Arc<dyn SourceFetcher>,
        2,
        Duration::from_secs(5),
    );
    (Arc::new(Scheduler::new(Arc::new(orch), interval)), fetcher)
}

fn spawn_start(
    sched: &Arc<Scheduler>,
    parent: &CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let sched = Arc::clone(sched);
    let parent = parent.clone();
    tokio::spawn(async move { sched.start(&parent).await })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn first_cycle_runs_immediately_then_once_per_tick() {
    let (sched, fetcher) = scheduler(INTERVAL);
    let parent = CancellationToken::new();
    let handle = spawn_start(&sched, &parent);

    settle().await;
    assert!(sched.is_running());
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    let next = sched.next_fetch_in();
    assert!(next > INTERVAL - Duration::from_secs(1) && next <= INTERVAL);

    tokio::time::sleep(INTERVAL).await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

    tokio::time::sleep(INTERVAL * 2).await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);

    let stats = sched.stats();
    assert!(stats.running);
    assert_eq!(stats.fetch_count, 4);
    assert_eq!(stats.error_count, 0);
    assert_eq!(stats.interval_secs, 60);
    assert_eq!(stats.last_successful_feeds, 1);
    assert!(stats.last_fetch.is_some());

    sched.stop().await;
    handle.await.unwrap();
    assert!(!sched.is_running());
    assert_eq!(sched.next_fetch_in(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn second_start_while_running_is_a_noop() {
    let (sched, fetcher) = scheduler(INTERVAL);
    let parent = CancellationToken::new();
    let handle = spawn_start(&sched, &parent);
    settle().await;

    // returns at once instead of running a second loop
    tokio::time::timeout(Duration::from_millis(1), sched.start(&parent))
        .await
        .expect("second start should return immediately");
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    sched.stop().await;
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn parent_cancellation_stops_the_loop() {
    let (sched, fetcher) = scheduler(INTERVAL);
    let parent = CancellationToken::new();
    let handle = spawn_start(&sched, &parent);
    settle().await;

    parent.cancel();
    handle.await.unwrap();
    assert!(!sched.is_running());

    tokio::time::sleep(INTERVAL * 3).await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stopped_scheduler_can_start_again() {
    let (sched, fetcher) = scheduler(INTERVAL);
    let parent = CancellationToken::new();

    let first = spawn_start(&sched, &parent);
    settle().await;
    sched.stop().await;
    first.await.unwrap();

    let second = spawn_start(&sched, &parent);
    settle().await;
    assert!(sched.is_running());
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(sched.stats().fetch_count, 2);

    sched.stop().await;
    second.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn interval_change_applies_after_the_pending_tick() {
    let (sched, fetcher) = scheduler(INTERVAL);
    let parent = CancellationToken::new();
    let handle = spawn_start(&sched, &parent);
    settle().await;

    sched.set_interval(Duration::from_secs(10));
    assert_eq!(sched.interval(), Duration::from_secs(10));

    // the tick already scheduled at 60s still fires at 60s
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

    // then every 10s
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);

    sched.stop().await;
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn run_once_does_not_touch_stats() {
    let (sched, fetcher) = scheduler(INTERVAL);

    let report = sched.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.successful_feeds, 1);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    let stats = sched.stats();
    assert!(!stats.running);
    assert_eq!(stats.fetch_count, 0);
    assert!(stats.last_fetch.is_none());
}

#[tokio::test(start_paused = true)]
async fn stop_when_idle_returns_immediately() {
    let (sched, _) = scheduler(INTERVAL);
    tokio::time::timeout(Duration::from_millis(1), sched.stop())
        .await
        .expect("idle stop should not wait");
}

/// Never answers the source listing and ignores cancellation,
/// like a database call stuck on a dead connection.
struct StuckStorage(MemoryStorage);

#[async_trait]
impl Storage for StuckStorage {
    async fn list_enabled_sources(&self) -> Result<Vec<Source>, StorageError> {
        std::future::pending().await
    }
    async fn list_sources(&self) -> Result<Vec<Source>, StorageError> {
        self.0.list_sources().await
    }
    async fn bulk_insert_articles(&self, articles: &[Article]) -> Result<usize, StorageError> {
        self.0.bulk_insert_articles(articles).await
    }
    async fn increment_error_count(&self, source_id: i64) -> Result<(), StorageError> {
        self.0.increment_error_count(source_id).await
    }
    async fn reset_error_count(&self, source_id: i64) -> Result<(), StorageError> {
        self.0.reset_error_count(source_id).await
    }
    async fn update_last_fetch(&self, source_id: i64, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.0.update_last_fetch(source_id, at).await
    }
    async fn get_pending_translations(&self, limit: usize) -> Result<Vec<Article>, StorageError> {
        self.0.get_pending_translations(limit).await
    }
    async fn update_translation(
        &self,
        article_id: i64,
        title: &str,
        description: &str,
        status: TranslationStatus,
    ) -> Result<(), StorageError> {
        self.0
            .update_translation(article_id, title, description, status)
            .await
    }
    async fn recent_articles(&self, limit: usize) -> Result<Vec<Article>, StorageError> {
        self.0.recent_articles(limit).await
    }
}

#[tokio::test(start_paused = true)]
async fn stop_gives_up_on_a_stuck_cycle_after_the_grace_period() {
    let storage = Arc::new(StuckStorage(MemoryStorage::with_sources(vec![one_source()])));
    let orch = FetchOrchestrator::new(
        storage,
        Arc::new(CountingFetcher::default()),
        2,
        Duration::from_secs(5),
    );
    let sched = Arc::new(Scheduler::new(Arc::new(orch), INTERVAL));
    let parent = CancellationToken::new();
    let loop_handle = spawn_start(&sched, &parent);
    settle().await;
    assert!(sched.is_running());

    let stopping = {
        let sched = Arc::clone(&sched);
        tokio::spawn(async move { sched.stop().await })
    };

    tokio::time::sleep(STOP_GRACE - Duration::from_secs(1)).await;
    assert!(!stopping.is_finished(), "stop returned before the grace period");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(stopping.is_finished(), "stop kept waiting past the grace period");
    stopping.await.unwrap();

    // the cycle itself is still wedged
    assert!(sched.is_running());
    loop_handle.abort();
}
