// src/translate/worker.rs
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::models::{Article, TranslationStatus};
use crate::storage::Storage;
use crate::translate::{retry_after_of, TranslateError, Translation, Translator};

pub const DEFAULT_TRANSLATION_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_BATCH_SIZE: usize = 5;
/// Gap between consecutive translation calls in one batch.
pub const ARTICLE_PACING: Duration = Duration::from_millis(500);

/// What one batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub fetched: usize,
    pub completed: usize,
    pub failed: usize,
    pub rate_limited: bool,
    /// The batch never ran because a backoff window was open.
    pub skipped_for_backoff: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub batches: u64,
    pub completed: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub backoff_remaining_secs: u64,
}

/// Background translator for articles queued as pending or failed.
///
/// Calls within a batch are sequential and paced. A rate-limit signal opens
/// a backoff window: the rest of the batch is abandoned and every batch
/// until the window closes is skipped.
pub struct TranslationWorker {
    storage: Arc<dyn Storage>,
    translator: Arc<dyn Translator>,
    interval: Duration,
    batch_size: usize,
    backoff_until: Mutex<Option<Instant>>,
    stats: Mutex<WorkerStats>,
}

impl TranslationWorker {
    pub fn new(
        storage: Arc<dyn Storage>,
        translator: Arc<dyn Translator>,
        interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            storage,
            translator,
            interval: interval.max(Duration::from_millis(1)),
            batch_size: batch_size.max(1),
            backoff_until: Mutex::new(None),
            stats: Mutex::new(WorkerStats::default()),
        }
    }

    fn backoff(&self) -> MutexGuard<'_, Option<Instant>> {
        self.backoff_until.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn stats_mut(&self) -> MutexGuard<'_, WorkerStats> {
        self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Time left in the current backoff window, if one is open.
    pub fn backoff_remaining(&self) -> Option<Duration> {
        let until = (*self.backoff())?;
        let left = until.saturating_duration_since(Instant::now());
        (!left.is_zero()).then_some(left)
    }

    pub fn stats(&self) -> WorkerStats {
        let mut s = self.stats_mut().clone();
        s.backoff_remaining_secs = self.backoff_remaining().map(|d| d.as_secs()).unwrap_or(0);
        s
    }

    /// Translate up to one batch. Safe to call directly (tests, manual runs).
    pub async fn process_batch(&self, cancel: &CancellationToken) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        if let Some(left) = self.backoff_remaining() {
            tracing::debug!(target: "translate", remaining_secs = left.as_secs(), "in rate-limit backoff, skipping batch");
            outcome.skipped_for_backoff = true;
            return outcome;
        }

        let articles = match self.storage.get_pending_translations(self.batch_size).await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(target: "translate", error = %e, "loading pending translations failed");
                return outcome;
            }
        };
        outcome.fetched = articles.len();
        if articles.is_empty() {
            return outcome;
        }
        tracing::info!(target: "translate", count = articles.len(), "translating batch");

        for (idx, article) in articles.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if idx > 0 {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ARTICLE_PACING) => {}
                }
            }

            match self.translate_article(article).await {
                Ok(t) => {
                    self.persist(article, &t.title, &t.description, TranslationStatus::Completed)
                        .await;
                    outcome.completed += 1;
                    counter!("translate_completed_total").increment(1);
                }
                Err(e) => {
                    // Current text stays; only the status changes.
                    self.persist(article, &article.title, &article.description, TranslationStatus::Failed)
                        .await;
                    outcome.failed += 1;
                    counter!("translate_failed_total").increment(1);

                    if let Some(wait) = retry_after_of(&e) {
                        *self.backoff() = Some(Instant::now() + wait);
                        outcome.rate_limited = true;
                        counter!("translate_rate_limited_total").increment(1);
                        tracing::warn!(
                            target: "translate",
                            article = article.id,
                            backoff_secs = wait.as_secs(),
                            error = %e,
                            "translator rate limited, backing off"
                        );
                        break;
                    }
                    tracing::warn!(target: "translate", article = article.id, error = %e, "translation failed");
                }
            }
        }

        let mut s = self.stats_mut();
        s.batches += 1;
        s.completed += outcome.completed as u64;
        s.failed += outcome.failed as u64;
        s.rate_limited += u64::from(outcome.rate_limited);
        s.last_run = Some(Utc::now());
        outcome
    }

    async fn translate_article(&self, article: &Article) -> Result<Translation, TranslateError> {
        let title = article.original_title.as_deref().unwrap_or(&article.title);
        let description = article
            .original_description
            .as_deref()
            .unwrap_or(&article.description);
        let language = article.original_language.as_deref().unwrap_or_default();
        self.translator.translate(title, description, language).await
    }

    async fn persist(&self, article: &Article, title: &str, description: &str, status: TranslationStatus) {
        if let Err(e) = self
            .storage
            .update_translation(article.id, title, description, status)
            .await
        {
            tracing::warn!(target: "translate", article = article.id, status = status.as_str(), error = %e, "saving translation failed");
        }
    }

    /// Run immediately, then every interval, until stopped.
    pub async fn run(&self, stop: &CancellationToken) {
        tracing::info!(
            target: "translate",
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "translation worker started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    self.process_batch(stop).await;
                }
            }
        }
        tracing::info!(target: "translate", "translation worker stopped");
    }

    /// Spawn [`run`](Self::run) on the runtime.
    pub fn spawn(self: Arc<Self>, parent: &CancellationToken) -> WorkerHandle {
        let stop = parent.child_token();
        let token = stop.clone();
        let join = tokio::spawn(async move { self.run(&token).await });
        WorkerHandle { stop, join }
    }
}

pub struct WorkerHandle {
    stop: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the loop and wait for the in-flight iteration to finish.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.join.await {
            tracing::warn!(target: "translate", error = %e, "translation worker task ended abnormally");
        }
    }
}
