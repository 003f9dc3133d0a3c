//! Persistence seam for sources and articles.
//!
//! The fetch cycle and the translation worker only talk to [`Storage`].
//! [`MemoryStorage`] is the in-process implementation used by the service
//! and the tests; a SQL-backed store plugs in behind the same trait.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Article, Source, TranslationStatus};
use crate::sources::SourceRegistry;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("source {0} not found")]
    SourceNotFound(i64),
    #[error("article {0} not found")]
    ArticleNotFound(i64),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn list_enabled_sources(&self) -> Result<Vec<Source>, StorageError>;
    async fn list_sources(&self) -> Result<Vec<Source>, StorageError>;

    /// Insert articles, skipping any whose GUID is already stored.
    /// Returns how many rows were actually inserted.
    async fn bulk_insert_articles(&self, articles: &[Article]) -> Result<usize, StorageError>;

    async fn increment_error_count(&self, source_id: i64) -> Result<(), StorageError>;
    async fn reset_error_count(&self, source_id: i64) -> Result<(), StorageError>;
    async fn update_last_fetch(&self, source_id: i64, at: DateTime<Utc>)
        -> Result<(), StorageError>;

    /// Pending articles first, then failed ones, oldest id first within each.
    async fn get_pending_translations(&self, limit: usize) -> Result<Vec<Article>, StorageError>;

    async fn update_translation(
        &self,
        article_id: i64,
        title: &str,
        description: &str,
        status: TranslationStatus,
    ) -> Result<(), StorageError>;

    /// Newest articles by publish date.
    async fn recent_articles(&self, limit: usize) -> Result<Vec<Article>, StorageError>;
}

#[derive(Default)]
struct Inner {
    sources: BTreeMap<i64, Source>,
    articles: BTreeMap<i64, Article>,
    guids: HashSet<String>,
    next_article_id: i64,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: impl IntoIterator<Item = Source>) -> Self {
        let store = Self::default();
        {
            let mut g = store.lock();
            for s in sources {
                g.sources.insert(s.id, s);
            }
        }
        store
    }

    pub fn from_registry(registry: &SourceRegistry) -> Self {
        Self::with_sources(registry.sources().iter().cloned())
    }

    pub fn source(&self, id: i64) -> Option<Source> {
        self.lock().sources.get(&id).cloned()
    }

    pub fn article(&self, id: i64) -> Option<Article> {
        self.lock().articles.get(&id).cloned()
    }

    pub fn article_by_guid(&self, guid: &str) -> Option<Article> {
        self.lock().articles.values().find(|a| a.guid == guid).cloned()
    }

    pub fn article_count(&self) -> usize {
        self.lock().articles.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a half-applied row
        // behind: every mutation below is a single map operation.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_source<F>(&self, source_id: i64, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut Source),
    {
        let mut g = self.lock();
        let src = g
            .sources
            .get_mut(&source_id)
            .ok_or(StorageError::SourceNotFound(source_id))?;
        f(src);
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn list_enabled_sources(&self) -> Result<Vec<Source>, StorageError> {
        Ok(self
            .lock()
            .sources
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }

    async fn list_sources(&self) -> Result<Vec<Source>, StorageError> {
        Ok(self.lock().sources.values().cloned().collect())
    }

    async fn bulk_insert_articles(&self, articles: &[Article]) -> Result<usize, StorageError> {
        let mut g = self.lock();
        let mut inserted = 0usize;
        for a in articles {
            if !g.guids.insert(a.guid.clone()) {
                continue;
            }
            g.next_article_id += 1;
            let id = g.next_article_id;
            let mut row = a.clone();
            row.id = id;
            g.articles.insert(id, row);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn increment_error_count(&self, source_id: i64) -> Result<(), StorageError> {
        self.with_source(source_id, |s| s.error_count = s.error_count.saturating_add(1))
    }

    async fn reset_error_count(&self, source_id: i64) -> Result<(), StorageError> {
        self.with_source(source_id, |s| s.error_count = 0)
    }

    async fn update_last_fetch(
        &self,
        source_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.with_source(source_id, |s| s.last_fetched_at = Some(at))
    }

    async fn get_pending_translations(&self, limit: usize) -> Result<Vec<Article>, StorageError> {
        let g = self.lock();
        let queued = g
            .articles
            .values()
            .filter(|a| a.original_language.is_some() && a.awaits_translation());
        let pending = queued
            .clone()
            .filter(|a| a.translation_status == TranslationStatus::Pending);
        let failed = queued.filter(|a| a.translation_status == TranslationStatus::Failed);
        Ok(pending
            .chain(failed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_translation(
        &self,
        article_id: i64,
        title: &str,
        description: &str,
        status: TranslationStatus,
    ) -> Result<(), StorageError> {
        let mut g = self.lock();
        let a = g
            .articles
            .get_mut(&article_id)
            .ok_or(StorageError::ArticleNotFound(article_id))?;
        a.title = title.to_string();
        a.description = description.to_string();
        a.translation_status = status;
        Ok(())
    }

    async fn recent_articles(&self, limit: usize) -> Result<Vec<Article>, StorageError> {
        let g = self.lock();
        let mut out: Vec<Article> = g.articles.values().cloned().collect();
        out.sort_by(|a, b| b.pub_date.cmp(&a.pub_date).then(b.id.cmp(&a.id)));
        out.truncate(limit);
        Ok(out)
    }
}
