// src/ingest/mod.rs
pub mod clean;
pub mod enrich;
pub mod feed;
pub mod pool;
pub mod scheduler;
pub mod types;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::ingest::pool::WorkerPool;
use crate::ingest::types::{FetchError, FetchJobResult, JobError, SourceFetcher};
use crate::models::Article;
use crate::storage::{Storage, StorageError};

/// Articles handed to storage per insert call.
pub const INSERT_BATCH_SIZE: usize = 100;
const LOGGED_ERRORS: usize = 5;

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("fetch_cycles_total", "Completed fetch cycles.");
        describe_counter!(
            "fetch_sources_failed_total",
            "Per-source fetch failures after retries."
        );
        describe_counter!(
            "fetch_articles_new_total",
            "Articles inserted by fetch cycles."
        );
        describe_counter!(
            "fetch_duplicates_total",
            "Articles dropped by in-cycle GUID deduplication."
        );
        describe_histogram!("fetch_cycle_ms", "Wall-clock fetch cycle time in milliseconds.");
        describe_histogram!("feed_parse_ms", "Feed parse time in milliseconds.");
        describe_gauge!("fetch_last_run_ts", "Unix ts when a fetch cycle last finished.");
    });
}

#[derive(Debug, Error)]
pub enum FetchCycleError {
    #[error("listing enabled sources: {0}")]
    ListSources(#[source] StorageError),
}

/// Aggregate outcome of one fetch cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub total_sources: usize,
    pub skipped_sources: usize,
    pub successful_feeds: usize,
    pub failed_feeds: usize,
    /// Articles produced by successful jobs, before deduplication.
    pub total_articles: usize,
    pub duplicates: usize,
    pub new_articles: usize,
    pub duration: Duration,
    pub avg_job_time: Duration,
    pub fastest_job: Duration,
    pub slowest_job: Duration,
    pub errors: Vec<FetchError>,
}

/// Keep the first article per GUID. Returns the survivors and the drop count.
pub fn dedup_by_guid(articles: Vec<Article>) -> (Vec<Article>, usize) {
    let mut seen = HashSet::with_capacity(articles.len());
    let mut unique = Vec::with_capacity(articles.len());
    let mut dropped = 0usize;
    for a in articles {
        if seen.insert(a.guid.clone()) {
            unique.push(a);
        } else {
            dropped += 1;
        }
    }
    (unique, dropped)
}

/// Split job results into pooled articles and failures.
fn collect_articles(results: &mut [FetchJobResult]) -> (Vec<Article>, Vec<FetchError>) {
    let mut articles = Vec::new();
    let mut errors = Vec::new();
    for r in results.iter_mut() {
        match &r.error {
            None => articles.append(&mut r.articles),
            Some(e) => errors.push(FetchError {
                source_id: r.source_id,
                source_key: r.source_key.clone(),
                message: e.to_string(),
            }),
        }
    }
    (articles, errors)
}

fn job_timings(results: &[FetchJobResult]) -> (Duration, Duration, Duration) {
    if results.is_empty() {
        return (Duration::ZERO, Duration::ZERO, Duration::ZERO);
    }
    let total: Duration = results.iter().map(|r| r.elapsed).sum();
    let fastest = results.iter().map(|r| r.elapsed).min().unwrap_or_default();
    let slowest = results.iter().map(|r| r.elapsed).max().unwrap_or_default();
    (total / results.len() as u32, fastest, slowest)
}

/// Lists sources, fans out fetches, deduplicates, stores, and updates health.
pub struct FetchOrchestrator {
    storage: Arc<dyn Storage>,
    pool: WorkerPool,
}

impl FetchOrchestrator {
    pub fn new(
        storage: Arc<dyn Storage>,
        fetcher: Arc<dyn SourceFetcher>,
        workers: usize,
        job_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            pool: WorkerPool::new(workers, job_timeout, fetcher),
        }
    }

    /// Fetch every healthy enabled source once.
    ///
    /// Only a failure to list sources is an error. Cancellation stops
    /// in-flight jobs; whatever completed is still stored and reported.
    pub async fn fetch_all(&self, cancel: &CancellationToken) -> Result<FetchReport, FetchCycleError> {
        ensure_metrics_described();
        let t0 = Instant::now();

        let sources = self
            .storage
            .list_enabled_sources()
            .await
            .map_err(FetchCycleError::ListSources)?;
        if sources.is_empty() {
            tracing::info!(target: "ingest", "no enabled sources");
            return Ok(FetchReport::default());
        }

        let total_sources = sources.len();
        let (healthy, unhealthy): (Vec<_>, Vec<_>) =
            sources.into_iter().partition(|s| s.is_healthy());
        for s in &unhealthy {
            tracing::info!(
                target: "ingest",
                source = %s.key,
                errors = s.error_count,
                "skipping unhealthy source"
            );
        }

        tracing::debug!(
            target: "ingest",
            healthy = healthy.len(),
            workers = self.pool.workers(),
            "dispatching fetch jobs"
        );
        let mut results = self.pool.run(healthy, cancel).await;
        let (avg_job_time, fastest_job, slowest_job) = job_timings(&results);

        let successful_feeds = results.iter().filter(|r| r.is_success()).count();
        let failed_feeds = results.len() - successful_feeds;

        let (pooled, errors) = collect_articles(&mut results);
        let total_articles = pooled.len();
        let (unique, duplicates) = dedup_by_guid(pooled);

        let new_articles = self.insert_in_batches(&unique).await;
        self.update_source_health(&results).await;

        let report = FetchReport {
            total_sources,
            skipped_sources: unhealthy.len(),
            successful_feeds,
            failed_feeds,
            total_articles,
            duplicates,
            new_articles,
            duration: t0.elapsed(),
            avg_job_time,
            fastest_job,
            slowest_job,
            errors,
        };

        counter!("fetch_cycles_total").increment(1);
        counter!("fetch_sources_failed_total").increment(failed_feeds as u64);
        counter!("fetch_articles_new_total").increment(new_articles as u64);
        counter!("fetch_duplicates_total").increment(duplicates as u64);
        histogram!("fetch_cycle_ms").record(report.duration.as_secs_f64() * 1_000.0);
        gauge!("fetch_last_run_ts").set(Utc::now().timestamp() as f64);

        log_report(&report);
        Ok(report)
    }

    /// Independent batches; a failed batch is logged and the rest still run.
    async fn insert_in_batches(&self, articles: &[Article]) -> usize {
        let mut inserted = 0usize;
        for (idx, batch) in articles.chunks(INSERT_BATCH_SIZE).enumerate() {
            match self.storage.bulk_insert_articles(batch).await {
                Ok(n) => inserted += n,
                Err(e) => tracing::warn!(
                    target: "ingest",
                    batch = idx,
                    size = batch.len(),
                    error = %e,
                    "article batch insert failed"
                ),
            }
        }
        inserted
    }

    /// Best-effort; a failed update is logged and never fails the cycle.
    async fn update_source_health(&self, results: &[FetchJobResult]) {
        let now = Utc::now();
        for r in results {
            match &r.error {
                // Shutdown is not the source's fault.
                Some(JobError::Cancelled) => {}
                Some(_) => {
                    if let Err(e) = self.storage.increment_error_count(r.source_id).await {
                        tracing::warn!(target: "ingest", source = %r.source_key, error = %e, "increment error count failed");
                    }
                }
                None => {
                    if let Err(e) = self.storage.reset_error_count(r.source_id).await {
                        tracing::warn!(target: "ingest", source = %r.source_key, error = %e, "reset error count failed");
                    }
                    if let Err(e) = self.storage.update_last_fetch(r.source_id, now).await {
                        tracing::warn!(target: "ingest", source = %r.source_key, error = %e, "update last fetch failed");
                    }
                }
            }
        }
    }
}

fn log_report(report: &FetchReport) {
    tracing::info!(
        target: "ingest",
        sources = report.total_sources,
        skipped = report.skipped_sources,
        ok = report.successful_feeds,
        failed = report.failed_feeds,
        articles = report.total_articles,
        new = report.new_articles,
        duplicates = report.duplicates,
        duration_ms = report.duration.as_millis() as u64,
        avg_ms = report.avg_job_time.as_millis() as u64,
        slowest_ms = report.slowest_job.as_millis() as u64,
        "fetch cycle finished"
    );
    for e in report.errors.iter().take(LOGGED_ERRORS) {
        tracing::warn!(target: "ingest", source = %e.source_key, error = %e.message, "source fetch failed");
    }
    if report.errors.len() > LOGGED_ERRORS {
        tracing::warn!(
            target: "ingest",
            "... and {} more source errors",
            report.errors.len() - LOGGED_ERRORS
        );
    }
}
