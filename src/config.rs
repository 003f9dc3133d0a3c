// src/config.rs
//! Runtime configuration read from the environment (after `.env`).
//!
//! Every key has a default, so an empty environment yields a working
//! service with translation disabled.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::ingest::pool::DEFAULT_WORKERS;
use crate::ingest::scheduler::DEFAULT_FETCH_INTERVAL;
use crate::ratelimit::{RateLimitConfig, Tier};
use crate::sources::DEFAULT_SOURCES_PATH;
use crate::translate::groq::DEFAULT_TRANSLATION_MODEL;
use crate::translate::worker::{DEFAULT_BATCH_SIZE, DEFAULT_TRANSLATION_INTERVAL};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_ARTICLE_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_TARGET_LANGUAGE: &str = "en";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: invalid value '{value}': {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchConfig {
    pub workers: usize,
    pub timeout: Duration,
    pub interval: Duration,
    pub max_age: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranslationConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub target_language: String,
    pub interval: Duration,
    pub batch_size: usize,
}

impl TranslationConfig {
    /// Translation runs only with an API key and a target language.
    pub fn enabled(&self) -> bool {
        self.api_key.is_some() && !self.target_language.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub fetch: FetchConfig,
    pub translation: TranslationConfig,
    pub rate_limit: RateLimitConfig,
    pub sources_path: PathBuf,
}

/// Parse `500ms`, `10s`, `3m`, `168h`, `1h30m`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".into());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in '{s}'"))?;
        if digits == 0 {
            return Err(format!("expected a number in '{s}'"));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| format!("bad number in '{s}'"))?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit_secs = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => return Err(format!("unknown unit '{other}' in '{s}'")),
        };
        total += Duration::from_secs_f64(value * unit_secs);
        rest = &rest[unit_len..];
    }
    Ok(total)
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("not a boolean: '{other}'")),
    }
}

struct Reader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Reader<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T>(
        &self,
        key: &str,
        default: T,
        parse: impl Fn(&str) -> Result<T, String>,
    ) -> Result<T, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(v) => parse(&v).map_err(|reason| ConfigError::Invalid {
                key: key.to_string(),
                value: v,
                reason,
            }),
        }
    }

    fn positive_usize(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        self.parsed(key, default, |v| match v.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err("expected a positive integer".into()),
        })
    }

    fn duration(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parsed(key, default, |v| {
            parse_duration(v).and_then(|d| {
                if d.is_zero() {
                    Err("duration must be positive".into())
                } else {
                    Ok(d)
                }
            })
        })
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let r = Reader { lookup };

        let fetch = FetchConfig {
            workers: r.positive_usize("FETCHER_WORKERS", DEFAULT_WORKERS)?,
            timeout: r.duration("FETCHER_TIMEOUT", DEFAULT_FETCH_TIMEOUT)?,
            interval: r.duration("FETCH_INTERVAL", DEFAULT_FETCH_INTERVAL)?,
            max_age: r.duration("FETCHER_MAX_AGE", DEFAULT_MAX_ARTICLE_AGE)?,
        };

        let translation = TranslationConfig {
            api_key: r.raw("GROQ_API_KEY"),
            model: r
                .raw("MODEL_TRANSLATION")
                .unwrap_or_else(|| DEFAULT_TRANSLATION_MODEL.to_string()),
            target_language: r
                .raw("TRANSLATION_TARGET_LANGUAGE")
                .unwrap_or_else(|| DEFAULT_TARGET_LANGUAGE.to_string())
                .to_ascii_lowercase(),
            interval: r.duration("TRANSLATION_INTERVAL", DEFAULT_TRANSLATION_INTERVAL)?,
            batch_size: r.positive_usize("TRANSLATION_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
        };

        let mut rate_limit = RateLimitConfig {
            enabled: r.parsed("RATE_LIMIT_ENABLED", true, parse_bool)?,
            ..RateLimitConfig::default()
        };
        for tier in [Tier::Anonymous, Tier::Free, Tier::Pro, Tier::Enterprise] {
            let prefix = format!("RATE_LIMIT_{}", tier.as_str().to_ascii_uppercase());
            let limits = rate_limit.limits_for_mut(tier);
            limits.per_minute =
                r.positive_usize(&format!("{prefix}_PER_MINUTE"), limits.per_minute as usize)? as u32;
            // Negative per-day means unlimited.
            limits.per_day = r.parsed(&format!("{prefix}_PER_DAY"), limits.per_day, |v| {
                match v.parse::<i64>() {
                    Ok(n) if n < 0 => Ok(None),
                    Ok(n) if n > 0 => u32::try_from(n)
                        .map(Some)
                        .map_err(|_| "too large".to_string()),
                    _ => Err("expected a positive integer or -1".into()),
                }
            })?;
        }

        let sources_path = r
            .raw("SOURCES_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCES_PATH));

        Ok(Self {
            fetch,
            translation,
            rate_limit,
            sources_path,
        })
    }
}
