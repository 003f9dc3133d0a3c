// src/ingest/scheduler.rs
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::ingest::{FetchCycleError, FetchOrchestrator, FetchReport};

pub const DEFAULT_FETCH_INTERVAL: Duration = Duration::from_secs(3 * 60);
/// How long `stop` waits for the loop to confirm exit.
pub const STOP_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SchedulerStats {
    pub running: bool,
    pub interval_secs: u64,
    pub last_fetch: Option<DateTime<Utc>>,
    pub fetch_count: u64,
    pub error_count: u64,
    pub last_successful_feeds: usize,
    pub last_failed_feeds: usize,
    pub last_new_articles: usize,
    pub last_duration_ms: u64,
}

#[derive(Default)]
struct State {
    running: bool,
    stop: Option<CancellationToken>,
    done: Option<watch::Receiver<bool>>,
    last_fetch: Option<DateTime<Utc>>,
    last_started: Option<Instant>,
    fetch_count: u64,
    error_count: u64,
    last_report: Option<FetchReport>,
}

/// Drives the fetch orchestrator on a fixed interval.
///
/// `start` runs one cycle immediately, then one per tick, until `stop` or the
/// parent token fires. Cycles never overlap; a slow cycle makes the next
/// tick late rather than doubling up.
pub struct Scheduler {
    orchestrator: Arc<FetchOrchestrator>,
    interval: Mutex<Duration>,
    state: Mutex<State>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<FetchOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval: Mutex::new(interval.max(Duration::from_millis(1))),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn interval(&self) -> Duration {
        *self.interval.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Takes effect from the next tick.
    pub fn set_interval(&self, interval: Duration) {
        let interval = interval.max(Duration::from_millis(1));
        *self.interval.lock().unwrap_or_else(|p| p.into_inner()) = interval;
        tracing::info!(target: "scheduler", interval_secs = interval.as_secs(), "interval updated");
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Run the loop on the current task. Returns once stopped.
    /// A second call while running returns immediately.
    pub async fn start(&self, parent: &CancellationToken) {
        let (stop, done_tx) = {
            let mut st = self.state();
            if st.running {
                tracing::debug!(target: "scheduler", "already running");
                return;
            }
            let stop = parent.child_token();
            let (tx, rx) = watch::channel(false);
            st.running = true;
            st.stop = Some(stop.clone());
            st.done = Some(rx);
            (stop, tx)
        };

        let mut period = self.interval();
        tracing::info!(target: "scheduler", interval_secs = period.as_secs(), "scheduler started");

        self.run_fetch(&stop).await;

        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    tracing::info!(target: "scheduler", "stop signal received");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_fetch(&stop).await;
                    let wanted = self.interval();
                    if wanted != period {
                        period = wanted;
                        ticker = tokio::time::interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
            }
        }

        {
            let mut st = self.state();
            st.running = false;
            st.stop = None;
        }
        let _ = done_tx.send(true);
    }

    /// Signal the loop and wait for it to exit, at most [`STOP_GRACE`].
    pub async fn stop(&self) {
        let (stop, done) = {
            let st = self.state();
            if !st.running {
                return;
            }
            (st.stop.clone(), st.done.clone())
        };
        tracing::info!(target: "scheduler", "stopping");
        if let Some(stop) = stop {
            stop.cancel();
        }
        let Some(mut done) = done else { return };
        let exited = tokio::time::timeout(STOP_GRACE, done.wait_for(|exited| *exited))
            .await
            .is_ok();
        if exited {
            tracing::info!(target: "scheduler", "stopped gracefully");
        } else {
            tracing::warn!(target: "scheduler", "stop timed out");
        }
    }

    /// One cycle outside the loop; stats are not touched.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<FetchReport, FetchCycleError> {
        self.orchestrator.fetch_all(cancel).await
    }

    /// Zero when idle, before the first cycle, or when a tick is overdue.
    pub fn next_fetch_in(&self) -> Duration {
        let st = self.state();
        match (st.running, st.last_started) {
            (true, Some(started)) => {
                (started + self.interval()).saturating_duration_since(Instant::now())
            }
            _ => Duration::ZERO,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let interval = self.interval();
        let st = self.state();
        let last = st.last_report.as_ref();
        SchedulerStats {
            running: st.running,
            interval_secs: interval.as_secs(),
            last_fetch: st.last_fetch,
            fetch_count: st.fetch_count,
            error_count: st.error_count,
            last_successful_feeds: last.map(|r| r.successful_feeds).unwrap_or(0),
            last_failed_feeds: last.map(|r| r.failed_feeds).unwrap_or(0),
            last_new_articles: last.map(|r| r.new_articles).unwrap_or(0),
            last_duration_ms: last.map(|r| r.duration.as_millis() as u64).unwrap_or(0),
        }
    }

    async fn run_fetch(&self, cancel: &CancellationToken) {
        tracing::info!(target: "scheduler", "fetch cycle starting");
        let started_at = Utc::now();
        let started = Instant::now();

        let result = self.orchestrator.fetch_all(cancel).await;

        let mut st = self.state();
        st.last_fetch = Some(started_at);
        st.last_started = Some(started);
        st.fetch_count += 1;
        match result {
            Ok(report) => {
                tracing::info!(
                    target: "scheduler",
                    new = report.new_articles,
                    ok = report.successful_feeds,
                    duration_ms = report.duration.as_millis() as u64,
                    "fetch cycle completed"
                );
                st.last_report = Some(report);
            }
            Err(e) => {
                st.error_count += 1;
                tracing::error!(target: "scheduler", error = %e, "fetch cycle failed");
            }
        }
    }
}
