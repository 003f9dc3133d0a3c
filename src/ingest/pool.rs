// src/ingest/pool.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ingest::types::{FetchJobResult, JobError, SourceFetcher};
use crate::models::Article;
use crate::sources::FeedSource;

pub const DEFAULT_WORKERS: usize = 50;
/// Attempts beyond the first.
pub const MAX_RETRIES: u32 = 2;
/// Backoff before retry `n` is `n * RETRY_STEP`.
pub const RETRY_STEP: Duration = Duration::from_millis(500);
const PROGRESS_EVERY: usize = 25;

/// Bounded-concurrency executor for per-source fetch jobs.
///
/// Every job is spawned up front and waits on a shared semaphore, so at most
/// `workers` fetches are in flight. Results come back in input order.
pub struct WorkerPool {
    workers: usize,
    job_timeout: Duration,
    fetcher: Arc<dyn SourceFetcher>,
}

impl WorkerPool {
    pub fn new(workers: usize, job_timeout: Duration, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            workers: workers.max(1),
            job_timeout,
            fetcher,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run one job per source. The returned vec is index-aligned with `sources`.
    pub async fn run<S>(&self, sources: Vec<S>, cancel: &CancellationToken) -> Vec<FetchJobResult>
    where
        S: FeedSource + 'static,
    {
        let total = sources.len();
        let gate = Arc::new(Semaphore::new(self.workers));
        let completed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = sources
            .into_iter()
            .map(|source| {
                let ident = (source.id(), source.key().to_string());
                let job = Job {
                    source,
                    fetcher: Arc::clone(&self.fetcher),
                    gate: Arc::clone(&gate),
                    timeout: self.job_timeout,
                    cancel: cancel.clone(),
                };
                let completed = Arc::clone(&completed);
                let handle = tokio::spawn(async move {
                    let res = job.execute().await;
                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    if done % PROGRESS_EVERY == 0 || done == total {
                        tracing::info!(target: "ingest", done, total, "fetch progress");
                    }
                    res
                });
                (ident, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(total);
        for ((source_id, source_key), handle) in handles {
            let res = match handle.await {
                Ok(res) => res,
                Err(e) => {
                    tracing::error!(target: "ingest", source = %source_key, error = %e, "fetch task aborted");
                    FetchJobResult {
                        source_id,
                        source_key,
                        articles: Vec::new(),
                        error: Some(JobError::Aborted(e.to_string())),
                        elapsed: Duration::ZERO,
                        retries: 0,
                    }
                }
            };
            results.push(res);
        }
        results
    }
}

struct Job<S> {
    source: S,
    fetcher: Arc<dyn SourceFetcher>,
    gate: Arc<Semaphore>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl<S: FeedSource> Job<S> {
    async fn execute(self) -> FetchJobResult {
        let started = Instant::now();

        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return self.finish(started, Err(JobError::Cancelled), 0),
            permit = Arc::clone(&self.gate).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return self.finish(started, Err(JobError::Cancelled), 0),
            },
        };

        let mut retries = 0u32;
        loop {
            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(JobError::Cancelled),
                r = tokio::time::timeout(self.timeout, self.fetcher.fetch_source(&self.source as &dyn FeedSource)) => match r {
                    Ok(Ok(articles)) => Ok(articles),
                    Ok(Err(e)) => Err(JobError::Feed(e)),
                    Err(_) => Err(JobError::Timeout(self.timeout)),
                },
            };

            match attempt {
                Ok(articles) => return self.finish(started, Ok(articles), retries),
                Err(JobError::Cancelled) => {
                    return self.finish(started, Err(JobError::Cancelled), retries)
                }
                Err(e) if retries < MAX_RETRIES => {
                    retries += 1;
                    let backoff = RETRY_STEP * retries;
                    tracing::debug!(
                        target: "ingest",
                        source = %self.source.key(),
                        attempt = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retrying fetch"
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            return self.finish(started, Err(JobError::Cancelled), retries)
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return self.finish(started, Err(e), retries),
            }
        }
    }

    fn finish(
        &self,
        started: Instant,
        outcome: Result<Vec<Article>, JobError>,
        retries: u32,
    ) -> FetchJobResult {
        let (articles, error) = match outcome {
            Ok(a) => (a, None),
            Err(e) => (Vec::new(), Some(e)),
        };
        FetchJobResult {
            source_id: self.source.id(),
            source_key: self.source.key().to_string(),
            articles,
            error,
            elapsed: started.elapsed(),
            retries,
        }
    }
}
