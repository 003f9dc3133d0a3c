// tests/pool_ordering.rs
//
// Worker pool: index-aligned results, bounded concurrency, per-attempt
// timeout with linear retry backoff, and cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use cryptosignal_news::ingest::pool::{WorkerPool, MAX_RETRIES};
use cryptosignal_news::ingest::types::{FeedError, JobError, SourceFetcher};
use cryptosignal_news::models::{Article, Source};
use cryptosignal_news::sources::FeedSource;

fn source(id: i64, key: &str) -> Source {
    Source {
        id,
        key: key.into(),
        name: key.into(),
        url: format!("https://{key}.test/rss"),
        category: "general".into(),
        language: "en".into(),
        enabled: true,
        reliability: 0.5,
        last_fetched_at: None,
        error_count: 0,
    }
}

fn one_article(source: &dyn FeedSource) -> Vec<Article> {
    let now = Utc::now();
    vec![Article::new(
        source.id(),
        format!("{}-1", source.key()),
        "t",
        "https://x",
        now,
        now,
    )]
}

#[derive(Clone, Copy)]
enum Behavior {
    Delay(Duration),
    Hang,
    Fail,
}

struct ScriptedFetcher {
    behavior: HashMap<String, Behavior>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedFetcher {
    fn new(behavior: &[(&str, Behavior)]) -> Self {
        Self {
            behavior: behavior.iter().map(|(k, b)| (k.to_string(), *b)).collect(),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn calls(&self, key: &str) -> usize {
        self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SourceFetcher for ScriptedFetcher {
    async fn fetch_source(&self, source: &dyn FeedSource) -> Result<Vec<Article>, FeedError> {
        *self.calls.lock().unwrap().entry(source.key().to_string()).or_insert(0) += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let behavior = self
            .behavior
            .get(source.key())
            .copied()
            .unwrap_or(Behavior::Delay(Duration::from_millis(10)));
        let out = match behavior {
            Behavior::Delay(d) => {
                tokio::time::sleep(d).await;
                Ok(one_article(source))
            }
            Behavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Behavior::Fail => Err(FeedError::Status(503)),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

#[tokio::test(start_paused = true)]
async fn results_follow_input_order_not_completion_order() {
    let fetcher = Arc::new(ScriptedFetcher::new(&[
        ("a", Behavior::Delay(Duration::from_millis(300))),
        ("b", Behavior::Delay(Duration::from_millis(200))),
        ("c", Behavior::Delay(Duration::from_millis(10))),
    ]));
    let pool = WorkerPool::new(3, Duration::from_secs(5), fetcher);

    let sources = vec![source(1, "a"), source(2, "b"), source(3, "c")];
    let results = pool.run(sources, &CancellationToken::new()).await;

    let keys: Vec<&str> = results.iter().map(|r| r.source_key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
    assert!(results.iter().all(|r| r.is_success() && r.retries == 0));
    assert!(results[2].elapsed < results[0].elapsed);
}

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_worker_count() {
    let keys: Vec<String> = (0..20).map(|i| format!("s{i}")).collect();
    let behavior: Vec<(&str, Behavior)> = keys
        .iter()
        .map(|k| (k.as_str(), Behavior::Delay(Duration::from_millis(50))))
        .collect();
    let fetcher = Arc::new(ScriptedFetcher::new(&behavior));
    let pool = WorkerPool::new(4, Duration::from_secs(5), fetcher.clone());

    let sources = keys
        .iter()
        .enumerate()
        .map(|(i, k)| source(i as i64 + 1, k))
        .collect();
    let results = pool.run(sources, &CancellationToken::new()).await;

    assert_eq!(results.len(), 20);
    assert!(fetcher.max_in_flight.load(Ordering::SeqCst) <= 4);
    assert!(fetcher.max_in_flight.load(Ordering::SeqCst) >= 2);
}

#[tokio::test(start_paused = true)]
async fn always_timing_out_job_is_attempted_one_plus_max_retries_times() {
    let fetcher = Arc::new(ScriptedFetcher::new(&[("slow", Behavior::Hang)]));
    let timeout = Duration::from_secs(2);
    let pool = WorkerPool::new(2, timeout, fetcher.clone());

    let started = Instant::now();
    let results = pool
        .run(vec![source(1, "slow")], &CancellationToken::new())
        .await;

    assert_eq!(fetcher.calls("slow"), 1 + MAX_RETRIES as usize);
    let r = &results[0];
    assert_eq!(r.error, Some(JobError::Timeout(timeout)));
    assert_eq!(r.retries, MAX_RETRIES);
    assert!(r.articles.is_empty());

    // three timeouts plus 500ms + 1000ms of backoff
    let expected = timeout * 3 + Duration::from_millis(1500);
    assert!(started.elapsed() >= expected);
}

#[tokio::test(start_paused = true)]
async fn failing_job_reports_last_error_and_others_still_succeed() {
    let fetcher = Arc::new(ScriptedFetcher::new(&[("bad", Behavior::Fail)]));
    let pool = WorkerPool::new(2, Duration::from_secs(1), fetcher.clone());

    let results = pool
        .run(vec![source(1, "bad"), source(2, "good")], &CancellationToken::new())
        .await;

    assert_eq!(results[0].error, Some(JobError::Feed(FeedError::Status(503))));
    assert_eq!(results[0].retries, MAX_RETRIES);
    assert_eq!(fetcher.calls("bad"), 3);
    assert!(results[1].is_success());
    assert_eq!(results[1].articles.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_resolves_waiting_and_running_jobs() {
    let fetcher = Arc::new(ScriptedFetcher::new(&[
        ("hang1", Behavior::Hang),
        ("hang2", Behavior::Hang),
    ]));
    // one slot: hang1 runs, hang2 waits on the gate
    let pool = WorkerPool::new(1, Duration::from_secs(3600), fetcher.clone());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let results = pool
        .run(vec![source(1, "hang1"), source(2, "hang2")], &cancel)
        .await;

    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|r| r.error == Some(JobError::Cancelled)));
    // only the job holding the single slot ever reached the fetcher
    assert_eq!(fetcher.calls("hang1") + fetcher.calls("hang2"), 1);
}

/// A bare source record, not a stored `Source`.
struct FixtureSource {
    id: i64,
    key: &'static str,
}

impl FeedSource for FixtureSource {
    fn id(&self) -> i64 {
        self.id
    }
    fn key(&self) -> &str {
        self.key
    }
    fn url(&self) -> &str {
        "https://fixture.test/rss"
    }
    fn category(&self) -> &str {
        "general"
    }
    fn language(&self) -> &str {
        "en"
    }
    fn is_enabled(&self) -> bool {
        true
    }
}

#[tokio::test(start_paused = true)]
async fn pool_accepts_any_feed_source() {
    let fetcher = Arc::new(ScriptedFetcher::new(&[("fx-b", Behavior::Fail)]));
    let pool = WorkerPool::new(2, Duration::from_secs(2), Arc::clone(&fetcher) as Arc<dyn SourceFetcher>);

    let results = pool
        .run(
            vec![
                FixtureSource { id: 7, key: "fx-a" },
                FixtureSource { id: 8, key: "fx-b" },
            ],
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(results[0].source_id, 7);
    assert_eq!(results[0].source_key, "fx-a");
    assert_eq!(results[0].articles[0].guid, "fx-a-1");
    assert_eq!(results[1].source_id, 8);
    assert!(results[1].error.is_some());
    assert_eq!(fetcher.calls("fx-a"), 1);
}
