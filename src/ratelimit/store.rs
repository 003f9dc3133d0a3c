// src/ratelimit/store.rs
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Extra lifetime granted to a record past its window.
pub const RECORD_TTL_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// One sliding window to check for one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
    pub key: String,
    pub window: Duration,
    pub limit: u32,
}

/// Entries currently inside a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowState {
    pub count: u32,
    /// Oldest surviving timestamp, unix micros.
    pub oldest_micros: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// `now` was recorded in every window. States are pre-insert.
    Admitted(Vec<WindowState>),
    /// Nothing recorded. `window` indexes the first full window.
    Rejected {
        window: usize,
        states: Vec<WindowState>,
    },
}

/// Time-ordered per-key event store backing the sliding windows.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// For each window: drop entries at or before `now - window`, then count.
    /// If every window is under its limit, record `now` in all of them.
    /// All-or-nothing across the given windows.
    async fn admit(&self, windows: &[WindowSpec], now_micros: i64) -> Result<Admission, StoreError>;

    /// Read-only view of one window.
    async fn usage(&self, key: &str, window: Duration, now_micros: i64)
        -> Result<WindowState, StoreError>;

    async fn reset(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Drop records whose TTL has passed. Returns how many went.
    async fn purge_expired(&self, now_micros: i64) -> Result<usize, StoreError>;
}

fn micros(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}

#[derive(Debug, Default)]
struct Record {
    /// Timestamp -> hits at that microsecond; bursts can collide.
    entries: BTreeMap<i64, u32>,
    total: u32,
    expires_at: i64,
}

impl Record {
    fn trim(&mut self, now_micros: i64, window: Duration) {
        let cutoff = now_micros.saturating_sub(micros(window));
        self.entries = self.entries.split_off(&cutoff.saturating_add(1));
        self.total = self.entries.values().sum();
    }

    fn state(&self) -> WindowState {
        WindowState {
            count: self.total,
            oldest_micros: self.entries.keys().next().copied(),
        }
    }
}

/// In-process [`CounterStore`]; one mutex makes `admit` atomic.
#[derive(Default)]
pub struct MemoryCounterStore {
    records: Mutex<HashMap<String, Record>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn key_count(&self) -> usize {
        self.lock().len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn admit(&self, windows: &[WindowSpec], now_micros: i64) -> Result<Admission, StoreError> {
        let mut records = self.lock();

        let mut states = Vec::with_capacity(windows.len());
        let mut full = None;
        for (idx, w) in windows.iter().enumerate() {
            if records
                .get(&w.key)
                .is_some_and(|r| r.expires_at <= now_micros)
            {
                records.remove(&w.key);
            }
            let state = match records.get_mut(&w.key) {
                Some(rec) => {
                    rec.trim(now_micros, w.window);
                    rec.state()
                }
                None => WindowState::default(),
            };
            if full.is_none() && state.count >= w.limit {
                full = Some(idx);
            }
            states.push(state);
        }

        if let Some(window) = full {
            return Ok(Admission::Rejected { window, states });
        }

        for w in windows {
            let rec = records.entry(w.key.clone()).or_default();
            *rec.entries.entry(now_micros).or_insert(0) += 1;
            rec.total += 1;
            rec.expires_at = now_micros.saturating_add(micros(w.window + RECORD_TTL_SLACK));
        }
        Ok(Admission::Admitted(states))
    }

    async fn usage(
        &self,
        key: &str,
        window: Duration,
        now_micros: i64,
    ) -> Result<WindowState, StoreError> {
        let records = self.lock();
        let Some(rec) = records.get(key).filter(|r| r.expires_at > now_micros) else {
            return Ok(WindowState::default());
        };
        let cutoff = now_micros.saturating_sub(micros(window));
        let live = rec.entries.range(cutoff.saturating_add(1)..);
        let mut state = WindowState::default();
        for (ts, hits) in live {
            state.oldest_micros.get_or_insert(*ts);
            state.count += hits;
        }
        Ok(state)
    }

    async fn reset(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut records = self.lock();
        for k in keys {
            records.remove(k);
        }
        Ok(())
    }

    async fn purge_expired(&self, now_micros: i64) -> Result<usize, StoreError> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, r| r.expires_at > now_micros);
        Ok(before - records.len())
    }
}

/// Periodically purge expired records until `cancel` fires.
pub fn spawn_sweeper(
    store: Arc<dyn CounterStore>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = chrono::Utc::now().timestamp_micros();
                    match store.purge_expired(now).await {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!(target: "ratelimit", purged = n, "expired rate-limit records purged"),
                        Err(e) => tracing::warn!(target: "ratelimit", error = %e, "rate-limit sweep failed"),
                    }
                }
            }
        }
    })
}
