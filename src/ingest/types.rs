// src/ingest/types.rs
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::models::Article;
use crate::sources::FeedSource;

/// One parsed feed entry, before it becomes an [`Article`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedItem {
    pub guid: String,
    pub title: String,
    pub link: String,
    pub description: String,
    /// Full body when the feed ships one (`content:encoded`, Atom `content`).
    pub content: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("http request failed: {0}")]
    Http(String),
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("feed body exceeds {0} bytes")]
    TooLarge(usize),
    #[error("feed parse error: {0}")]
    Parse(String),
}

/// Fetches one feed URL and parses it into items.
#[async_trait]
pub trait FeedRetriever: Send + Sync {
    async fn fetch_and_parse(&self, url: &str, timeout: Duration)
        -> Result<Vec<FeedItem>, FeedError>;
}

/// Turns a source into ready-to-store articles. One call is one attempt.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch_source(&self, source: &dyn FeedSource) -> Result<Vec<Article>, FeedError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("fetch cancelled")]
    Cancelled,
    #[error("fetch task aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Feed(#[from] FeedError),
}

/// Outcome of one source in one fetch cycle.
#[derive(Debug, Clone)]
pub struct FetchJobResult {
    pub source_id: i64,
    pub source_key: String,
    /// Empty when `error` is set.
    pub articles: Vec<Article>,
    pub error: Option<JobError>,
    pub elapsed: Duration,
    /// Extra attempts used beyond the first.
    pub retries: u32,
}

impl FetchJobResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-source error surfaced in the cycle report.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FetchError {
    pub source_id: i64,
    pub source_key: String,
    pub message: String,
}
