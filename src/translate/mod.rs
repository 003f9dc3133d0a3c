//! Translation of non-English articles through an LLM collaborator.

pub mod groq;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Backoff used when a 429-class signal carries no explicit duration.
pub const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("translation api returned {status}: {message}")]
    Api {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("translation request failed: {0}")]
    Transport(String),
    #[error("translation response unusable: {0}")]
    Response(String),
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        title: &str,
        description: &str,
        source_language: &str,
    ) -> Result<Translation, TranslateError>;
}

/// How long to back off after `err`, or `None` if it is not a rate limit.
///
/// Checked in order: an explicit retry-after, then HTTP 429, then the
/// error text. The text check is best-effort and only catches providers
/// that phrase the condition the usual way.
pub fn retry_after_of(err: &TranslateError) -> Option<Duration> {
    if let TranslateError::Api {
        retry_after: Some(d),
        ..
    } = err
    {
        if !d.is_zero() {
            return Some(*d);
        }
    }
    if let TranslateError::Api { status: 429, .. } = err {
        return Some(DEFAULT_RATE_LIMIT_BACKOFF);
    }
    let msg = err.to_string();
    if msg.contains("429") || msg.to_ascii_lowercase().contains("rate limit") {
        return Some(DEFAULT_RATE_LIMIT_BACKOFF);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, message: &str, retry_after: Option<Duration>) -> TranslateError {
        TranslateError::Api {
            status,
            message: message.into(),
            retry_after,
        }
    }

    #[test]
    fn explicit_retry_after_wins() {
        let e = api(429, "slow down", Some(Duration::from_secs(30)));
        assert_eq!(retry_after_of(&e), Some(Duration::from_secs(30)));
    }

    #[test]
    fn status_429_without_duration_defaults_to_a_minute() {
        assert_eq!(retry_after_of(&api(429, "", None)), Some(DEFAULT_RATE_LIMIT_BACKOFF));
        assert_eq!(
            retry_after_of(&api(429, "", Some(Duration::ZERO))),
            Some(DEFAULT_RATE_LIMIT_BACKOFF)
        );
    }

    #[test]
    fn message_heuristic_is_last_resort() {
        let e = TranslateError::Transport("upstream said: Rate limit reached".into());
        assert_eq!(retry_after_of(&e), Some(DEFAULT_RATE_LIMIT_BACKOFF));
        let e = TranslateError::Response("HTTP 429 from proxy".into());
        assert_eq!(retry_after_of(&e), Some(DEFAULT_RATE_LIMIT_BACKOFF));
    }

    #[test]
    fn ordinary_failures_are_not_rate_limits() {
        assert_eq!(retry_after_of(&api(500, "boom", None)), None);
        assert_eq!(retry_after_of(&TranslateError::Transport("reset".into())), None);
    }
}
