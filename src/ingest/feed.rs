// src/ingest/feed.rs
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{
    format_description::well_known::{Rfc2822, Rfc3339},
    OffsetDateTime,
};

use crate::ingest::clean::{sanitize_for_db, DESCRIPTION_MAX_CHARS, TITLE_MAX_CHARS};
use crate::ingest::enrich;
use crate::ingest::types::{FeedError, FeedItem, FeedRetriever, SourceFetcher};
use crate::models::Article;
use crate::sources::FeedSource;

/// Bodies larger than this are refused before parsing.
pub const MAX_FEED_BYTES: usize = 10 * 1024 * 1024;

const USER_AGENT: &str = "cryptosignal-news/0.1 (+rss fetcher)";

// ---- RSS 2.0 ----

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    description: Option<String>,
    guid: Option<TextNode>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    #[serde(rename = "dc:date", alias = "date")]
    dc_date: Option<String>,
    #[serde(rename = "content:encoded", alias = "encoded")]
    content: Option<String>,
    #[serde(rename = "category", default)]
    categories: Vec<TextNode>,
}

/// Element whose attributes we ignore and whose text we keep.
#[derive(Debug, Deserialize, Default)]
struct TextNode {
    #[serde(rename = "$text", default)]
    value: String,
}

// ---- Atom ----

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    id: Option<String>,
    title: Option<TextNode>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    summary: Option<TextNode>,
    content: Option<TextNode>,
    published: Option<String>,
    updated: Option<String>,
    #[serde(rename = "category", default)]
    categories: Vec<AtomCategory>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: String,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomCategory {
    #[serde(rename = "@term")]
    term: String,
}

/// RFC 2822 first (RSS), then RFC 3339 (Atom, dc:date).
pub fn parse_feed_date(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    let parsed = OffsetDateTime::parse(ts, &Rfc2822)
        .or_else(|_| {
            let numeric = ts.replace(" GMT", " +0000").replace(" UTC", " +0000");
            OffsetDateTime::parse(&numeric, &Rfc2822)
        })
        .or_else(|_| OffsetDateTime::parse(ts, &Rfc3339))
        .ok()?;
    DateTime::<Utc>::from_timestamp(parsed.unix_timestamp(), parsed.nanosecond())
}

/// HTML entities that are not valid XML but show up in real feeds.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", "&#160;")
        .replace("&ndash;", "&#8211;")
        .replace("&mdash;", "&#8212;")
        .replace("&ldquo;", "&#8220;")
        .replace("&rdquo;", "&#8221;")
        .replace("&lsquo;", "&#8216;")
        .replace("&rsquo;", "&#8217;")
        .replace("&hellip;", "&#8230;")
}

/// Parse an RSS 2.0 or Atom document into feed items.
pub fn parse_feed(body: &str) -> Result<Vec<FeedItem>, FeedError> {
    let xml = scrub_html_entities_for_xml(body);
    if xml.contains("<rss") {
        parse_rss(&xml)
    } else if xml.contains("<feed") {
        parse_atom(&xml)
    } else {
        Err(FeedError::Parse("neither an rss nor an atom document".into()))
    }
}

fn parse_rss(xml: &str) -> Result<Vec<FeedItem>, FeedError> {
    let rss: Rss = from_str(xml).map_err(|e| FeedError::Parse(e.to_string()))?;
    Ok(rss
        .channel
        .items
        .into_iter()
        .map(|it| {
            let link = it.link.unwrap_or_default().trim().to_string();
            let guid = it
                .guid
                .map(|g| g.value.trim().to_string())
                .filter(|g| !g.is_empty())
                .unwrap_or_else(|| link.clone());
            FeedItem {
                guid,
                title: it.title.unwrap_or_default(),
                link,
                description: it.description.unwrap_or_default(),
                content: it.content.filter(|c| !c.trim().is_empty()),
                published: it
                    .pub_date
                    .or(it.dc_date)
                    .as_deref()
                    .and_then(parse_feed_date),
                categories: it.categories.into_iter().map(|c| c.value).collect(),
            }
        })
        .collect())
}

fn parse_atom(xml: &str) -> Result<Vec<FeedItem>, FeedError> {
    let feed: AtomFeed = from_str(xml).map_err(|e| FeedError::Parse(e.to_string()))?;
    Ok(feed
        .entries
        .into_iter()
        .map(|e| {
            let link = e
                .links
                .iter()
                .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
                .or_else(|| e.links.first())
                .map(|l| l.href.trim().to_string())
                .unwrap_or_default();
            let guid = e
                .id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| link.clone());
            FeedItem {
                guid,
                title: e.title.map(|t| t.value).unwrap_or_default(),
                link,
                description: e.summary.map(|s| s.value).unwrap_or_default(),
                content: e.content.map(|c| c.value).filter(|c| !c.trim().is_empty()),
                published: e
                    .published
                    .or(e.updated)
                    .as_deref()
                    .and_then(parse_feed_date),
                categories: e.categories.into_iter().map(|c| c.term).collect(),
            }
        })
        .collect())
}

/// reqwest-backed retriever for live feeds.
pub struct HttpFeedRetriever {
    client: reqwest::Client,
}

impl HttpFeedRetriever {
    pub fn new() -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| FeedError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedRetriever for HttpFeedRetriever {
    async fn fetch_and_parse(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Vec<FeedItem>, FeedError> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .header(
                reqwest::header::ACCEPT,
                "application/rss+xml, application/atom+xml, application/xml;q=0.9, */*;q=0.8",
            )
            .send()
            .await
            .map_err(|e| FeedError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }
        if resp
            .content_length()
            .is_some_and(|len| len as usize > MAX_FEED_BYTES)
        {
            return Err(FeedError::TooLarge(MAX_FEED_BYTES));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FeedError::Http(e.to_string()))?;
        if bytes.len() > MAX_FEED_BYTES {
            return Err(FeedError::TooLarge(MAX_FEED_BYTES));
        }
        let body = String::from_utf8_lossy(&bytes);

        let t0 = Instant::now();
        let items = parse_feed(&body)?;
        histogram!("feed_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("feed_items_parsed_total").increment(items.len() as u64);
        Ok(items)
    }
}

/// How feed items become articles.
#[derive(Debug, Clone)]
pub struct ArticleOptions {
    pub max_age: Duration,
    /// Lowercased; `None` disables translation marking.
    pub target_language: Option<String>,
}

/// Convert feed items for `source` into enriched articles as of `now`.
///
/// Items published before `now - max_age` are dropped; an item exactly at
/// the cutoff is kept. Items without a publish date count as published now.
pub fn build_articles(
    source: &dyn FeedSource,
    items: Vec<FeedItem>,
    opts: &ArticleOptions,
    now: DateTime<Utc>,
) -> Vec<Article> {
    let max_age = chrono::Duration::from_std(opts.max_age).unwrap_or(chrono::Duration::MAX);
    let min_date = now.checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);

    let source_lang = source.language().trim().to_ascii_lowercase();
    let needs_translation = match opts.target_language.as_deref() {
        Some(target) => !target.is_empty() && !source_lang.is_empty() && source_lang != target,
        None => false,
    };

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let pub_date = item.published.unwrap_or(now);
        if pub_date < min_date {
            continue;
        }

        let title = sanitize_for_db(&item.title, TITLE_MAX_CHARS);
        let body = item.content.as_deref().unwrap_or(&item.description);
        let description = sanitize_for_db(body, DESCRIPTION_MAX_CHARS);

        let mut article = Article::new(
            source.id(),
            item.guid.trim(),
            title,
            item.link.trim(),
            pub_date,
            now,
        );
        article.description = description;
        article.categories = item
            .categories
            .iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();

        if needs_translation {
            article.mark_for_translation(&source_lang);
        }

        enrich::enrich(&mut article, source.category(), now);
        out.push(article);
    }
    out
}

/// [`SourceFetcher`] that retrieves the feed and builds articles from it.
pub struct FeedFetcher {
    retriever: Arc<dyn FeedRetriever>,
    timeout: Duration,
    options: ArticleOptions,
}

impl FeedFetcher {
    pub fn new(retriever: Arc<dyn FeedRetriever>, timeout: Duration, options: ArticleOptions) -> Self {
        Self {
            retriever,
            timeout,
            options,
        }
    }
}

#[async_trait]
impl SourceFetcher for FeedFetcher {
    async fn fetch_source(&self, source: &dyn FeedSource) -> Result<Vec<Article>, FeedError> {
        let items = self
            .retriever
            .fetch_and_parse(source.url(), self.timeout)
            .await?;
        Ok(build_articles(source, items, &self.options, Utc::now()))
    }
}
