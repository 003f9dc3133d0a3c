//! Per-caller sliding-window admission control for the public API.
//!
//! Two windows per caller: one minute and one day. A request is admitted
//! only if both have room; a tier with an unlimited day skips that window.
//! Store failures fail open.

pub mod middleware;
pub mod store;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::ratelimit::store::{Admission, CounterStore, StoreError, WindowSpec, WindowState};

pub const MINUTE_WINDOW: Duration = Duration::from_secs(60);
pub const DAY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Anonymous,
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTier(pub String);

impl fmt::Display for UnknownTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown tier '{}'", self.0)
    }
}

impl std::error::Error for UnknownTier {}

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anonymous" => Ok(Tier::Anonymous),
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(UnknownTier(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierLimits {
    pub per_minute: u32,
    /// `None` means unlimited.
    pub per_day: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub anonymous: TierLimits,
    pub free: TierLimits,
    pub pro: TierLimits,
    pub enterprise: TierLimits,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            anonymous: TierLimits {
                per_minute: 5,
                per_day: Some(100),
            },
            free: TierLimits {
                per_minute: 10,
                per_day: Some(500),
            },
            pro: TierLimits {
                per_minute: 60,
                per_day: Some(10_000),
            },
            enterprise: TierLimits {
                per_minute: 300,
                per_day: None,
            },
        }
    }
}

impl RateLimitConfig {
    pub fn limits_for(&self, tier: Tier) -> TierLimits {
        match tier {
            Tier::Anonymous => self.anonymous,
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Enterprise => self.enterprise,
        }
    }

    pub fn limits_for_mut(&mut self, tier: Tier) -> &mut TierLimits {
        match tier {
            Tier::Anonymous => &mut self.anonymous,
            Tier::Free => &mut self.free,
            Tier::Pro => &mut self.pro,
            Tier::Enterprise => &mut self.enterprise,
        }
    }
}

/// Result of one admission check, in the shape quota headers need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub admitted: bool,
    /// Per-minute limit of the caller's tier.
    pub limit: u32,
    /// Requests left after this one, in whichever window is tighter.
    pub remaining: u32,
    /// Until the minute window has room for a full burst again.
    pub reset_after: Duration,
    /// Set on rejection: how long until the blocking window frees a slot.
    pub retry_after: Option<Duration>,
    /// The store failed and the request was let through.
    pub fail_open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub tier: Tier,
    pub requests_this_minute: u32,
    pub requests_today: u32,
    pub remaining_this_minute: u32,
    /// -1 when the tier has no daily cap.
    pub remaining_today: i64,
    pub limit_per_minute: u32,
    /// -1 when the tier has no daily cap.
    pub limit_per_day: i64,
    pub reset_minute_secs: u64,
    pub reset_day_secs: u64,
}

pub fn minute_key(identifier: &str) -> String {
    format!("ratelimit:minute:{identifier}")
}

pub fn day_key(identifier: &str) -> String {
    format!("ratelimit:day:{identifier}")
}

/// Time until the oldest entry leaves the window; full window when empty.
fn until_slot_frees(state: &WindowState, window: Duration, now_micros: i64) -> Duration {
    match state.oldest_micros {
        Some(oldest) => {
            let window_micros = i64::try_from(window.as_micros()).unwrap_or(i64::MAX);
            let frees_at = oldest.saturating_add(window_micros);
            Duration::from_micros(u64::try_from(frees_at.saturating_sub(now_micros)).unwrap_or(0))
        }
        None => window,
    }
}

/// Headroom of the tightest window once `extra` more hits are counted.
fn remaining_across(windows: &[WindowSpec], states: &[WindowState], extra: u32) -> u32 {
    windows
        .iter()
        .zip(states)
        .map(|(w, s)| w.limit.saturating_sub(s.count.saturating_add(extra)))
        .min()
        .unwrap_or(0)
}

/// Round up to whole seconds, at least one.
pub fn ceil_secs(d: Duration) -> u64 {
    let s = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    s.max(1)
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn limits_for(&self, tier: Tier) -> TierLimits {
        self.config.limits_for(tier)
    }

    fn windows_for(&self, identifier: &str, limits: TierLimits) -> Vec<WindowSpec> {
        let mut windows = vec![WindowSpec {
            key: minute_key(identifier),
            window: MINUTE_WINDOW,
            limit: limits.per_minute,
        }];
        if let Some(per_day) = limits.per_day {
            windows.push(WindowSpec {
                key: day_key(identifier),
                window: DAY_WINDOW,
                limit: per_day,
            });
        }
        windows
    }

    pub async fn check(&self, identifier: &str, tier: Tier) -> RateDecision {
        self.check_at(identifier, tier, chrono::Utc::now().timestamp_micros())
            .await
    }

    /// Admission check at an explicit time (unix micros).
    pub async fn check_at(&self, identifier: &str, tier: Tier, now_micros: i64) -> RateDecision {
        let limits = self.limits_for(tier);
        let windows = self.windows_for(identifier, limits);

        match self.store.admit(&windows, now_micros).await {
            Ok(Admission::Admitted(states)) => {
                let minute = states.first().copied().unwrap_or_default();
                // The request just recorded counts against the window too.
                let reset_after = if minute.count == 0 {
                    MINUTE_WINDOW
                } else {
                    until_slot_frees(&minute, MINUTE_WINDOW, now_micros)
                };
                RateDecision {
                    admitted: true,
                    limit: limits.per_minute,
                    remaining: remaining_across(&windows, &states, 1),
                    reset_after,
                    retry_after: None,
                    fail_open: false,
                }
            }
            Ok(Admission::Rejected { window, states }) => {
                let minute = states.first().copied().unwrap_or_default();
                let blocking = windows.get(window).unwrap_or(&windows[0]);
                let blocking_state = states.get(window).copied().unwrap_or_default();
                let retry_after = until_slot_frees(&blocking_state, blocking.window, now_micros);
                counter!("ratelimit_rejected_total", "tier" => tier.as_str()).increment(1);
                tracing::debug!(
                    target: "ratelimit",
                    identifier,
                    tier = tier.as_str(),
                    window = %blocking.key,
                    "request over quota"
                );
                RateDecision {
                    admitted: false,
                    limit: limits.per_minute,
                    remaining: remaining_across(&windows, &states, 0),
                    reset_after: until_slot_frees(&minute, MINUTE_WINDOW, now_micros),
                    retry_after: Some(retry_after),
                    fail_open: false,
                }
            }
            Err(e) => self.fail_open(identifier, limits, &e),
        }
    }

    fn fail_open(&self, identifier: &str, limits: TierLimits, err: &StoreError) -> RateDecision {
        counter!("ratelimit_fail_open_total").increment(1);
        tracing::warn!(
            target: "ratelimit",
            identifier,
            error = %err,
            "rate limiter store unavailable, failing open"
        );
        RateDecision {
            admitted: true,
            limit: limits.per_minute,
            remaining: limits.per_minute,
            reset_after: MINUTE_WINDOW,
            retry_after: None,
            fail_open: true,
        }
    }

    pub async fn usage(&self, identifier: &str, tier: Tier) -> Result<UsageStats, StoreError> {
        self.usage_at(identifier, tier, chrono::Utc::now().timestamp_micros())
            .await
    }

    pub async fn usage_at(
        &self,
        identifier: &str,
        tier: Tier,
        now_micros: i64,
    ) -> Result<UsageStats, StoreError> {
        let limits = self.limits_for(tier);
        let minute = self
            .store
            .usage(&minute_key(identifier), MINUTE_WINDOW, now_micros)
            .await?;
        let day = self
            .store
            .usage(&day_key(identifier), DAY_WINDOW, now_micros)
            .await?;

        let (remaining_today, limit_per_day) = match limits.per_day {
            Some(cap) => (i64::from(cap.saturating_sub(day.count)), i64::from(cap)),
            None => (-1, -1),
        };

        Ok(UsageStats {
            tier,
            requests_this_minute: minute.count,
            requests_today: day.count,
            remaining_this_minute: limits.per_minute.saturating_sub(minute.count),
            remaining_today,
            limit_per_minute: limits.per_minute,
            limit_per_day,
            reset_minute_secs: until_slot_frees(&minute, MINUTE_WINDOW, now_micros).as_secs(),
            reset_day_secs: until_slot_frees(&day, DAY_WINDOW, now_micros).as_secs(),
        })
    }

    /// Forget every recorded request for `identifier`.
    pub async fn reset(&self, identifier: &str) -> Result<(), StoreError> {
        self.store
            .reset(&[minute_key(identifier), day_key(identifier)])
            .await
    }
}
