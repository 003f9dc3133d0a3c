// tests/translation_backoff.rs
//
// Translation worker against a scripted translator: rate-limit backoff
// abandons the batch, other errors do not, pacing between calls, and the
// pending-before-failed retry order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use cryptosignal_news::models::{Article, TranslationStatus};
use cryptosignal_news::storage::{MemoryStorage, Storage};
use cryptosignal_news::translate::worker::{TranslationWorker, ARTICLE_PACING};
use cryptosignal_news::translate::{TranslateError, Translation, Translator};

/// Fails the n-th call (1-based) with the given error, succeeds otherwise.
struct ScriptedTranslator {
    calls: AtomicUsize,
    fail_on: Option<(usize, TranslateError)>,
    seen: Mutex<Vec<(String, String)>>,
}

impl ScriptedTranslator {
    fn new(fail_on: Option<(usize, TranslateError)>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Translator for ScriptedTranslator {
    async fn translate(
        &self,
        title: &str,
        description: &str,
        source_language: &str,
    ) -> Result<Translation, TranslateError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen
            .lock()
            .unwrap()
            .push((title.to_string(), source_language.to_string()));
        match &self.fail_on {
            Some((at, err)) if *at == n => Err(err.clone()),
            _ => Ok(Translation {
                title: format!("EN {title}"),
                description: format!("EN {description}"),
            }),
        }
    }
}

async fn seeded_storage(count: usize) -> Arc<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new());
    let now = Utc::now();
    let articles: Vec<Article> = (1..=count)
        .map(|i| {
            let mut a = Article::new(2, format!("ko-{i}"), format!("제목 {i}"), "https://x", now, now);
            a.description = format!("본문 {i}");
            a.mark_for_translation("ko");
            a
        })
        .collect();
    storage.bulk_insert_articles(&articles).await.unwrap();
    storage
}

fn worker(storage: &Arc<MemoryStorage>, translator: &Arc<ScriptedTranslator>) -> TranslationWorker {
    TranslationWorker::new(
        Arc::clone(storage) as Arc<dyn Storage>,
        Arc::clone(translator) as Arc<dyn Translator>,
        Duration::from_secs(30),
        5,
    )
}

fn rate_limited(after: Duration) -> TranslateError {
    TranslateError::Api {
        status: 429,
        message: "Rate limit reached".into(),
        retry_after: Some(after),
    }
}

fn status(storage: &MemoryStorage, id: i64) -> TranslationStatus {
    storage.article(id).unwrap().translation_status
}

#[tokio::test(start_paused = true)]
async fn rate_limit_mid_batch_abandons_the_rest_and_backs_off() {
    let storage = seeded_storage(5).await;
    let translator = Arc::new(ScriptedTranslator::new(Some((
        3,
        rate_limited(Duration::from_secs(30)),
    ))));
    let w = worker(&storage, &translator);
    let cancel = CancellationToken::new();

    let outcome = w.process_batch(&cancel).await;
    assert_eq!(outcome.fetched, 5);
    assert_eq!(outcome.completed, 2);
    assert_eq!(outcome.failed, 1);
    assert!(outcome.rate_limited);
    assert_eq!(translator.calls(), 3);

    assert_eq!(status(&storage, 1), TranslationStatus::Completed);
    assert_eq!(status(&storage, 2), TranslationStatus::Completed);
    assert_eq!(status(&storage, 3), TranslationStatus::Failed);
    assert_eq!(status(&storage, 4), TranslationStatus::Pending);
    assert_eq!(status(&storage, 5), TranslationStatus::Pending);

    // the failed article keeps its text
    assert_eq!(storage.article(3).unwrap().title, "제목 3");
    assert_eq!(storage.article(1).unwrap().title, "EN 제목 1");

    // nothing is sent while the window is open
    let skipped = w.process_batch(&cancel).await;
    assert!(skipped.skipped_for_backoff);
    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(w.process_batch(&cancel).await.skipped_for_backoff);
    assert_eq!(translator.calls(), 3);
    assert!(w.backoff_remaining().is_some());
    assert!(w.stats().backoff_remaining_secs <= 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(w.backoff_remaining().is_none());
    let resumed = w.process_batch(&cancel).await;
    assert!(!resumed.skipped_for_backoff);
    assert_eq!(resumed.fetched, 3);
    assert_eq!(resumed.completed, 3);
    assert_eq!(translator.calls(), 6);

    // pending ones go first, the failed one is retried last
    let order: Vec<String> = translator.seen.lock().unwrap()[3..]
        .iter()
        .map(|(t, _)| t.clone())
        .collect();
    assert_eq!(order, vec!["제목 4", "제목 5", "제목 3"]);
    assert!((1..=5).all(|id| status(&storage, id) == TranslationStatus::Completed));

    let stats = w.stats();
    assert_eq!(stats.batches, 2);
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.rate_limited, 1);
}

#[tokio::test(start_paused = true)]
async fn ordinary_errors_do_not_stop_the_batch() {
    let storage = seeded_storage(5).await;
    let translator = Arc::new(ScriptedTranslator::new(Some((
        2,
        TranslateError::Transport("connection reset".into()),
    ))));
    let w = worker(&storage, &translator);

    let outcome = w.process_batch(&CancellationToken::new()).await;
    assert_eq!(outcome.completed, 4);
    assert_eq!(outcome.failed, 1);
    assert!(!outcome.rate_limited);
    assert_eq!(translator.calls(), 5);
    assert_eq!(status(&storage, 2), TranslationStatus::Failed);
    assert!(w.backoff_remaining().is_none());
}

#[tokio::test(start_paused = true)]
async fn calls_are_paced_and_use_the_original_text() {
    let storage = seeded_storage(4).await;
    let translator = Arc::new(ScriptedTranslator::new(None));
    let w = worker(&storage, &translator);

    let started = Instant::now();
    let outcome = w.process_batch(&CancellationToken::new()).await;
    assert_eq!(outcome.completed, 4);
    assert!(started.elapsed() >= ARTICLE_PACING * 3);

    let seen = translator.seen.lock().unwrap().clone();
    assert_eq!(seen[0], ("제목 1".to_string(), "ko".to_string()));
}

#[tokio::test(start_paused = true)]
async fn nothing_pending_means_no_calls() {
    let storage = Arc::new(MemoryStorage::new());
    let translator = Arc::new(ScriptedTranslator::new(None));
    let w = worker(&storage, &translator);

    let outcome = w.process_batch(&CancellationToken::new()).await;
    assert_eq!(outcome.fetched, 0);
    assert_eq!(translator.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn spawned_worker_runs_immediately_and_stops_on_request() {
    let storage = seeded_storage(2).await;
    let translator = Arc::new(ScriptedTranslator::new(None));
    let w = Arc::new(worker(&storage, &translator));

    let handle = Arc::clone(&w).spawn(&CancellationToken::new());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(translator.calls(), 2);

    handle.stop().await;
    assert_eq!(w.stats().batches, 1);
}

#[tokio::test(start_paused = true)]
async fn cancelling_the_shared_token_ends_the_worker() {
    let storage = seeded_storage(1).await;
    let translator = Arc::new(ScriptedTranslator::new(None));
    let w = Arc::new(worker(&storage, &translator));
    let shutdown = CancellationToken::new();

    let handle = Arc::clone(&w).spawn(&shutdown);
    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(1), handle.stop())
        .await
        .expect("worker should exit once the shared token is cancelled");

    // no further batches after shutdown
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(w.stats().batches, 1);
}
