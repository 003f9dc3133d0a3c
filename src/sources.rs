//! # Source Registry
//!
//! Read-only list of feed origins, built once at startup and handed to
//! storage and anything else that needs source metadata.
//!
//! - Loads `[[sources]]` tables from a TOML file.
//! - Falls back to a built-in `default_seed()` when no file is present.
//! - Ids are assigned in file order, starting at 1.
//! - Keys must be unique; duplicates are rejected at load time.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::models::Source;

pub const DEFAULT_SOURCES_PATH: &str = "config/sources.toml";

/// The narrow capability the fetch path needs from a source record.
pub trait FeedSource: Send + Sync {
    fn id(&self) -> i64;
    fn key(&self) -> &str;
    fn url(&self) -> &str;
    fn category(&self) -> &str;
    /// Language the feed is written in, e.g. `ko`.
    fn language(&self) -> &str;
    fn is_enabled(&self) -> bool;
}

impl FeedSource for Source {
    fn id(&self) -> i64 {
        self.id
    }
    fn key(&self) -> &str {
        &self.key
    }
    fn url(&self) -> &str {
        &self.url
    }
    fn category(&self) -> &str {
        &self.category
    }
    fn language(&self) -> &str {
        &self.language
    }
    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    sources: Vec<SourceEntry>,
}

#[derive(Debug, Deserialize)]
struct SourceEntry {
    key: String,
    name: String,
    url: String,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default = "default_language")]
    language: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default = "default_reliability")]
    reliability: f64,
}

fn default_category() -> String {
    "general".to_string()
}
fn default_language() -> String {
    "en".to_string()
}
fn default_enabled() -> bool {
    true
}
fn default_reliability() -> f64 {
    0.7
}

#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<Source>,
}

impl SourceRegistry {
    /// Build from already-constructed records (fixtures, tests).
    pub fn from_sources(sources: Vec<Source>) -> Self {
        Self { sources }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let file: RegistryFile = toml::from_str(s).context("parsing source registry toml")?;
        let mut seen = HashSet::new();
        let mut sources = Vec::with_capacity(file.sources.len());
        for (idx, e) in file.sources.into_iter().enumerate() {
            let key = e.key.trim().to_ascii_lowercase();
            if key.is_empty() {
                bail!("source #{} has an empty key", idx + 1);
            }
            if !seen.insert(key.clone()) {
                bail!("duplicate source key '{key}'");
            }
            sources.push(Source {
                id: idx as i64 + 1,
                key,
                name: e.name.trim().to_string(),
                url: e.url.trim().to_string(),
                category: e.category.trim().to_ascii_lowercase(),
                language: e.language.trim().to_ascii_lowercase(),
                enabled: e.enabled,
                reliability: e.reliability.clamp(0.0, 1.0),
                last_fetched_at: None,
                error_count: 0,
            });
        }
        Ok(Self { sources })
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading source registry from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load the file if it exists, otherwise use the built-in seed.
    /// A file that exists but fails to parse is an error.
    pub fn load_or_seed<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::info!(path = %path.display(), "source registry file missing, using built-in seed");
            Ok(Self::default_seed())
        }
    }

    /// Built-in seed with well-known crypto news feeds.
    pub fn default_seed() -> Self {
        let seed = [
            ("coindesk", "CoinDesk", "https://www.coindesk.com/arc/outboundfeeds/rss/", "general", "en", 0.9),
            ("cointelegraph", "Cointelegraph", "https://cointelegraph.com/rss", "general", "en", 0.85),
            ("decrypt", "Decrypt", "https://decrypt.co/feed", "general", "en", 0.8),
            ("theblock", "The Block", "https://www.theblock.co/rss.xml", "general", "en", 0.85),
            ("bitcoinmagazine", "Bitcoin Magazine", "https://bitcoinmagazine.com/.rss/full/", "bitcoin", "en", 0.8),
            ("cryptoslate", "CryptoSlate", "https://cryptoslate.com/feed/", "general", "en", 0.75),
            ("blockworks", "Blockworks", "https://blockworks.co/feed", "market", "en", 0.8),
            ("thedefiant", "The Defiant", "https://thedefiant.io/feed", "defi", "en", 0.75),
            ("tokenpost", "TokenPost", "https://www.tokenpost.kr/rss", "general", "ko", 0.7),
            ("coinpost", "CoinPost", "https://coinpost.jp/?feed=rss2", "general", "ja", 0.7),
        ];
        let sources = seed
            .into_iter()
            .enumerate()
            .map(|(idx, (key, name, url, category, language, reliability))| Source {
                id: idx as i64 + 1,
                key: key.to_string(),
                name: name.to_string(),
                url: url.to_string(),
                category: category.to_string(),
                language: language.to_string(),
                enabled: true,
                reliability,
                last_fetched_at: None,
                error_count: 0,
            })
            .collect();
        Self { sources }
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn get(&self, key: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.key.eq_ignore_ascii_case(key))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter().filter(|s| s.is_enabled())
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
