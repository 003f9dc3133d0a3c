// src/ratelimit/middleware.rs
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::ratelimit::{ceil_secs, RateDecision, RateLimiter, Tier};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Address used when neither proxy headers nor the peer are known.
/// Every such request shares this one bucket.
pub const UNKNOWN_CLIENT: &str = "unknown";

static UNKNOWN_CLIENT_WARNED: OnceCell<()> = OnceCell::new();

/// Authenticated caller, placed in request extensions by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub tier: Tier,
}

/// Identity the limiter counted this request under; handlers can read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey {
    pub identifier: String,
    pub tier: Tier,
}

#[derive(Serialize)]
struct OverQuota {
    error: &'static str,
    message: &'static str,
    retry_after: u64,
}

/// `user:<id>` for authenticated callers, else `ip:<addr>`.
///
/// The address comes from the first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the socket peer. The service is meant to sit behind a
/// proxy that sets one of those headers; without them and without
/// `ConnectInfo`, all anonymous callers fall into [`UNKNOWN_CLIENT`].
pub fn client_identifier(
    headers: &HeaderMap,
    caller: Option<&Caller>,
    remote: Option<SocketAddr>,
) -> String {
    if let Some(c) = caller {
        return format!("user:{}", c.user_id);
    }
    let header_ip = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let ip = header_ip("x-forwarded-for")
        .or_else(|| header_ip("x-real-ip"))
        .or_else(|| remote.map(|r| r.ip().to_string()))
        .unwrap_or_else(|| {
            UNKNOWN_CLIENT_WARNED.get_or_init(|| {
                tracing::warn!(
                    target: "ratelimit",
                    "request without X-Forwarded-For, X-Real-IP or peer address; \
                     anonymous callers share one rate-limit bucket"
                );
            });
            UNKNOWN_CLIENT.to_string()
        });
    format!("ip:{ip}")
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: impl ToString) {
    if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), v);
    }
}

fn apply_quota_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    let reset_at = chrono::Utc::now().timestamp() as u64 + ceil_secs(decision.reset_after);
    set_header(headers, HEADER_LIMIT, decision.limit);
    set_header(headers, HEADER_REMAINING, decision.remaining);
    set_header(headers, HEADER_RESET, reset_at);
}

fn over_quota_response(decision: &RateDecision) -> Response {
    let retry_after = ceil_secs(decision.retry_after.unwrap_or(decision.reset_after));
    let body = OverQuota {
        error: "rate_limit_exceeded",
        message: "You have exceeded your rate limit. Please try again later.",
        retry_after,
    };
    let mut resp = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    apply_quota_headers(resp.headers_mut(), decision);
    set_header(resp.headers_mut(), "retry-after", retry_after);
    resp
}

/// Axum middleware: admit or reject before the handler runs.
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    mut req: Request,
    next: Next,
) -> Response {
    let caller = req.extensions().get::<Caller>().cloned();
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let identifier = client_identifier(req.headers(), caller.as_ref(), remote);
    let tier = caller.map(|c| c.tier).unwrap_or_default();

    req.extensions_mut().insert(ClientKey {
        identifier: identifier.clone(),
        tier,
    });

    if !limiter.is_enabled() {
        return next.run(req).await;
    }

    let decision = limiter.check(&identifier, tier).await;
    if !decision.admitted {
        return over_quota_response(&decision);
    }

    let mut resp = next.run(req).await;
    apply_quota_headers(resp.headers_mut(), &decision);
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_prefers_user_then_forwarded_then_real_ip_then_peer() {
        let peer: SocketAddr = "10.0.0.9:5555".parse().unwrap();
        let mut h = HeaderMap::new();

        assert_eq!(client_identifier(&h, None, Some(peer)), "ip:10.0.0.9");
        assert_eq!(client_identifier(&h, None, None), format!("ip:{UNKNOWN_CLIENT}"));

        h.insert("x-real-ip", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(client_identifier(&h, None, Some(peer)), "ip:198.51.100.7");

        h.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.5, 10.0.0.1"));
        assert_eq!(client_identifier(&h, None, Some(peer)), "ip:203.0.113.5");

        let caller = Caller {
            user_id: "42".into(),
            tier: Tier::Pro,
        };
        assert_eq!(client_identifier(&h, Some(&caller), Some(peer)), "user:42");
    }
}
