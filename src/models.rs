//! Domain records shared by ingestion, translation and the API.
//!
//! `Source` carries the health bookkeeping the fetch cycle relies on;
//! `Article` carries the translation sub-state the translation worker owns.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A source with this many consecutive errors is skipped by the fetch cycle.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;
/// Error count from which a source is considered in backoff.
pub const BACKOFF_THRESHOLD: u32 = 3;

const BACKOFF_BASE_MINUTES: u64 = 5;
const BACKOFF_CAP_MINUTES: u64 = 120;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub url: String,
    pub category: String,
    pub language: String,
    pub enabled: bool,
    pub reliability: f64,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub error_count: u32,
}

impl Source {
    /// Enabled and below the consecutive error ceiling.
    pub fn is_healthy(&self) -> bool {
        self.enabled && self.error_count < MAX_CONSECUTIVE_ERRORS
    }

    pub fn needs_backoff(&self) -> bool {
        self.error_count >= BACKOFF_THRESHOLD
    }

    /// `5min * 2^(errors-3)`, capped at two hours. Zero below the threshold.
    pub fn backoff_duration(&self) -> Duration {
        if !self.needs_backoff() {
            return Duration::ZERO;
        }
        let exp = (self.error_count - BACKOFF_THRESHOLD).min(16);
        let minutes = BACKOFF_BASE_MINUTES
            .saturating_mul(1u64 << exp)
            .min(BACKOFF_CAP_MINUTES);
        Duration::from_secs(minutes * 60)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TranslationStatus {
    #[default]
    None,
    Pending,
    Completed,
    Failed,
}

impl TranslationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranslationStatus::None => "none",
            TranslationStatus::Pending => "pending",
            TranslationStatus::Completed => "completed",
            TranslationStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Article {
    /// Assigned by storage on insert; zero until then.
    pub id: i64,
    pub source_id: i64,
    pub guid: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub pub_date: DateTime<Utc>,
    pub categories: Vec<String>,
    pub coins: Vec<String>,
    pub is_breaking: bool,
    pub created_at: DateTime<Utc>,

    pub original_title: Option<String>,
    pub original_description: Option<String>,
    pub original_language: Option<String>,
    pub translation_status: TranslationStatus,
}

impl Article {
    pub fn new(
        source_id: i64,
        guid: impl Into<String>,
        title: impl Into<String>,
        link: impl Into<String>,
        pub_date: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            source_id,
            guid: guid.into(),
            title: title.into(),
            link: link.into(),
            description: String::new(),
            pub_date,
            categories: Vec::new(),
            coins: Vec::new(),
            is_breaking: false,
            created_at,
            original_title: None,
            original_description: None,
            original_language: None,
            translation_status: TranslationStatus::None,
        }
    }

    /// Snapshot the current text as the original and queue the article.
    pub fn mark_for_translation(&mut self, language: &str) {
        self.original_title = Some(self.title.clone());
        self.original_description = Some(self.description.clone());
        self.original_language = Some(language.to_string());
        self.translation_status = TranslationStatus::Pending;
    }

    pub fn awaits_translation(&self) -> bool {
        matches!(
            self.translation_status,
            TranslationStatus::Pending | TranslationStatus::Failed
        )
    }
}
