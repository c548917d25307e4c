//! Fixed-window rate limiting.
//!
//! Each (policy, key) pair gets a counter that resets `window_ms` after the
//! window opened. Fixed windows admit up to 2x `max_requests` across a
//! window boundary; that approximation is deliberate and keeps the limiter a
//! single counter per key.
//!
//! The limiter itself is pure bookkeeping: `check` takes `now` explicitly
//! and `sweep` is driven by a caller-owned cadence, so tests use synthetic
//! time and never sleep.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::middleware::error::ApiErrorResponse;
use crate::state::AppState;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    /// Namespaces the counter key so policies never share windows.
    pub name: &'static str,
    pub window_ms: i64,
    pub max_requests: u32,
    pub message: &'static str,
}

/// General endpoint traffic.
pub const PUBLIC_POLICY: RateLimitPolicy = RateLimitPolicy {
    name: "public",
    window_ms: 60_000,
    max_requests: 100,
    message: "Too many requests from this client, please try again later.",
};

/// Sensitive surfaces (endpoint enumeration).
pub const STRICT_POLICY: RateLimitPolicy = RateLimitPolicy {
    name: "strict",
    window_ms: 60_000,
    max_requests: 20,
    message: "Too many requests to this resource, please try again later.",
};

/// Tool execution, keyed by API key when one is presented.
pub const TOOL_EXECUTION_POLICY: RateLimitPolicy = RateLimitPolicy {
    name: "tool",
    window_ms: 60_000,
    max_requests: 50,
    message: "Tool execution rate limit exceeded, please try again later.",
};

#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    window_reset_at: DateTime<Utc>,
}

/// Outcome of one `check` call; everything headers need.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Zero when allowed.
    pub retry_after_secs: u64,
}

#[derive(Default)]
pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against `key` under `policy` as of `now`.
    pub fn check(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let mut entry = self
            .entries
            .entry(format!("{}:{}", policy.name, key))
            .or_insert_with(|| RateLimitEntry {
                count: 0,
                window_reset_at: now + Duration::milliseconds(policy.window_ms),
            });

        if now >= entry.window_reset_at {
            entry.count = 0;
            entry.window_reset_at = now + Duration::milliseconds(policy.window_ms);
        }

        let allowed = entry.count < policy.max_requests;
        if allowed {
            entry.count += 1;
        }

        let retry_after_secs = if allowed {
            0
        } else {
            (entry.window_reset_at - now).num_seconds().max(1) as u64
        };

        RateLimitDecision {
            allowed,
            limit: policy.max_requests,
            remaining: policy.max_requests.saturating_sub(entry.count),
            reset_at: entry.window_reset_at,
            retry_after_secs,
        }
    }

    /// Drop entries whose window ended before `now`. Returns how many went.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.window_reset_at > now);
        before - self.entries.len()
    }
}

/// Add `X-RateLimit-*` headers to a response. The reset instant is ISO-8601.
pub fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    let pairs = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.to_rfc3339()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

/// Rate-limit key for generic traffic: first `X-Forwarded-For` hop, else
/// the peer address, else a shared bucket.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// Tool-execution key: the API key when one is presented (header, bearer,
/// or query param), else the client key.
pub fn execution_key(
    headers: &HeaderMap,
    query_api_key: Option<&str>,
    peer: Option<SocketAddr>,
) -> String {
    if let Some(key) = crate::middleware::auth::presented_api_key(headers, query_api_key) {
        return format!("key:{key}");
    }
    client_key(headers, peer)
}

fn peer_of(req: &Request) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
}

/// Layer applied to the whole public endpoint surface.
pub async fn public_rate_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let key = client_key(req.headers(), peer_of(&req));
    let decision = state.rate_limiter.check(&key, &PUBLIC_POLICY, Utc::now());

    if !decision.allowed {
        let mut response =
            ApiErrorResponse::rate_limited(PUBLIC_POLICY.message, decision.retry_after_secs)
                .into_response();
        apply_headers(response.headers_mut(), &decision);
        return response;
    }

    let mut response = next.run(req).await;
    apply_headers(response.headers_mut(), &decision);
    response
}
