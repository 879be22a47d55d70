use crate::config::{Config, ResetMode};
use crate::tracker::RateLimitTracker;
use crate::types::RateLimitCategory;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Retries after the first attempt for transport failures and 5xx.
pub const MAX_RETRIES: u32 = 3;

// Epoch values this small would predate 2001; servers sending them mean "seconds from now".
const EPOCH_FLOOR: i64 = 1_000_000_000;

/// Raw rate-limit headers, each absent when missing or unparseable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateHeaders {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub reset: Option<i64>,
    /// `Retry-After` resolved to an absolute time.
    pub retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub retriable: bool,
}

/// What a response did to the tracker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Reconciled {
    Recorded,
    RateLimited,
    Ignored,
}

/// A quota-consuming call to dispatch through `send_tracked`.
#[derive(Debug, Clone)]
pub struct TrackedRequest<'a> {
    pub category: RateLimitCategory,
    pub method: Method,
    pub path: &'a str,
    pub body: Option<&'a serde_json::Value>,
    pub cost: u32,
}

#[derive(Debug, Clone)]
pub struct TrackedResponse {
    pub status: StatusCode,
    pub body: Option<serde_json::Value>,
    pub rate: RateHeaders,
    pub reconciled: Reconciled,
    pub error: Option<ErrorInfo>,
}

pub fn build_client(cfg: &Config) -> reqwest::Result<Client> {
    let mut default_headers = HeaderMap::new();
    if let Ok(ua) = HeaderValue::from_str(&cfg.user_agent) {
        default_headers.insert(USER_AGENT, ua);
    }
    Client::builder()
        .default_headers(default_headers)
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .use_rustls_tls()
        .build()
}

fn auth_header(token: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!("Bearer {}", token)).ok()
}

pub fn map_status_to_error(status: StatusCode, message: String) -> ErrorInfo {
    let (code, retriable) = match status {
        StatusCode::BAD_REQUEST => ("bad_request", false),
        StatusCode::UNAUTHORIZED => ("unauthorized", false),
        StatusCode::FORBIDDEN => ("forbidden", false),
        StatusCode::NOT_FOUND => ("not_found", false),
        StatusCode::CONFLICT => ("conflict", false),
        StatusCode::UNPROCESSABLE_ENTITY => ("validation_error", false),
        StatusCode::TOO_MANY_REQUESTS => ("rate_limited", true),
        s if s.is_server_error() => ("upstream_error", true),
        _ => ("server_error", false),
    };
    ErrorInfo {
        code: code.to_string(),
        message,
        retriable,
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
}

/// `now + secs`, or `None` when the offset is out of range.
pub fn offset_secs(now: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    ChronoDuration::try_seconds(secs).and_then(|d| now.checked_add_signed(d))
}

/// `Retry-After` is either delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<i64>() {
        return offset_secs(now, secs.max(0));
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

pub fn extract_rate_headers(headers: &HeaderMap, now: DateTime<Utc>) -> RateHeaders {
    RateHeaders {
        limit: header_i64(headers, "x-ratelimit-limit"),
        remaining: header_i64(headers, "x-ratelimit-remaining"),
        reset: header_i64(headers, "x-ratelimit-reset"),
        retry_at: headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| parse_retry_after(s, now)),
    }
}

/// Turn a raw `X-RateLimit-Reset` value into an absolute boundary.
pub fn resolve_reset(raw: i64, mode: ResetMode, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match mode {
        ResetMode::Relative => offset_secs(now, raw),
        ResetMode::Epoch if raw < EPOCH_FLOOR => offset_secs(now, raw),
        ResetMode::Epoch => DateTime::<Utc>::from_timestamp(raw, 0),
    }
}

/// Feed a completed response's metadata into the tracker.
///
/// A 429 zeroes the category; `Retry-After` wins over `X-RateLimit-Reset` as
/// the reset hint. Any other response is recorded only when all three
/// `X-RateLimit-*` headers are present.
pub fn reconcile(
    tracker: &RateLimitTracker,
    category: RateLimitCategory,
    status: StatusCode,
    rate: &RateHeaders,
    mode: ResetMode,
) -> Reconciled {
    let now = tracker.now();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let hint = rate
            .retry_at
            .or_else(|| rate.reset.and_then(|r| resolve_reset(r, mode, now)));
        if tracker.record_rate_limited(category, rate.limit, hint) {
            return Reconciled::RateLimited;
        }
        return Reconciled::Ignored;
    }
    let (Some(limit), Some(remaining), Some(reset)) = (rate.limit, rate.remaining, rate.reset)
    else {
        debug!("{} response carried no complete rate headers", category);
        return Reconciled::Ignored;
    };
    let Some(reset_at) = resolve_reset(reset, mode, now) else {
        return Reconciled::Ignored;
    };
    if tracker.record_from_response(category, limit, remaining, reset_at) {
        Reconciled::Recorded
    } else {
        Reconciled::Ignored
    }
}

fn compute_backoff(attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(d) = retry_after {
        return d;
    }
    // Exponential backoff with jitter: base 200ms * 2^attempt, max 5s.
    let base = 200u64.saturating_mul(1u64 << attempt.min(5));
    let max = 5_000u64.min(base);
    let jitter = fastrand::u64(0..=max / 2);
    Duration::from_millis(max / 2 + jitter)
}

/// Dispatch a quota-consuming request: decrement optimistically, send, reconcile.
///
/// Transport failures and 5xx are retried with backoff. A 429 is recorded, never retried.
pub async fn send_tracked(
    client: &Client,
    cfg: &Config,
    tracker: &RateLimitTracker,
    request: TrackedRequest<'_>,
) -> TrackedResponse {
    let TrackedRequest {
        category,
        method,
        path,
        body,
        cost,
    } = request;
    let url = match cfg.endpoint(path) {
        Ok(u) => u,
        Err(message) => {
            warn!("{} request refused: {}", category, message);
            return TrackedResponse {
                status: StatusCode::BAD_REQUEST,
                body: None,
                rate: RateHeaders::default(),
                reconciled: Reconciled::Ignored,
                error: Some(ErrorInfo {
                    code: "bad_request".into(),
                    message,
                    retriable: false,
                }),
            };
        }
    };
    tracker.apply_optimistic_decrement(category, cost);
    let mut attempt: u32 = 0;
    loop {
        let mut req = client
            .request(method.clone(), &url)
            .header(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(auth) = cfg.token.as_deref().and_then(auth_header) {
            req = req.header(AUTHORIZATION, auth);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let res = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("{} {} error sending request: {}", method, url, e);
                if attempt < MAX_RETRIES {
                    tokio::time::sleep(compute_backoff(attempt, None)).await;
                    attempt += 1;
                    continue;
                }
                return TrackedResponse {
                    status: StatusCode::BAD_GATEWAY,
                    body: None,
                    rate: RateHeaders::default(),
                    reconciled: Reconciled::Ignored,
                    error: Some(ErrorInfo {
                        code: "upstream_error".into(),
                        message: e.to_string(),
                        retriable: true,
                    }),
                };
            }
        };

        let status = res.status();
        let rate = extract_rate_headers(res.headers(), tracker.now());

        if status.is_server_error() && attempt < MAX_RETRIES {
            let backoff = compute_backoff(attempt, None);
            warn!(
                "{} {} retrying (status {}), backoff {:?}",
                method, url, status, backoff
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
            continue;
        }

        let reconciled = reconcile(tracker, category, status, &rate, cfg.reset_mode);
        let text = res.text().await.unwrap_or_default();
        if status.is_success() {
            let body = serde_json::from_str(&text).ok();
            return TrackedResponse {
                status,
                body,
                rate,
                reconciled,
                error: None,
            };
        }
        return TrackedResponse {
            status,
            body: None,
            rate,
            reconciled,
            error: Some(map_status_to_error(status, text)),
        };
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusLimit {
    /// Either a bare count or a limiter rule such as "10/month".
    pub limit: serde_json::Value,
    pub remaining: i64,
    #[serde(default)]
    pub reset_after: Option<i64>,
    #[serde(default)]
    pub reset_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusBody {
    #[serde(default)]
    pub limits: HashMap<String, StatusLimit>,
}

/// Leading count of a limit value: `10`, `"10"`, `"10/month"`, `"10 per hour"`.
pub fn parse_limit_value(v: &serde_json::Value) -> Option<i64> {
    match v {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => {
            let digits: String = s
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

/// Record every known category of a status body. Returns the categories written.
pub fn apply_status_body(
    tracker: &RateLimitTracker,
    body: &StatusBody,
    mode: ResetMode,
) -> Vec<RateLimitCategory> {
    let now = tracker.now();
    // One entry per category; the canonical key wins over an alias.
    let mut chosen: HashMap<RateLimitCategory, (&str, &StatusLimit)> = HashMap::new();
    for (key, entry) in &body.limits {
        let Ok(category) = key.parse::<RateLimitCategory>() else {
            debug!("skipping unknown limiter '{}' in status body", key);
            continue;
        };
        if key.as_str() == category.as_str() || !chosen.contains_key(&category) {
            chosen.insert(category, (key.as_str(), entry));
        }
    }
    let mut recorded = Vec::new();
    for (category, (key, entry)) in chosen {
        let Some(limit) = parse_limit_value(&entry.limit) else {
            warn!("unparseable limit {:?} for {}", entry.limit, key);
            continue;
        };
        let reset_at = match (entry.reset_at, entry.reset_after) {
            (Some(at), _) => resolve_reset(at, mode, now),
            (None, Some(after)) => offset_secs(now, after),
            (None, None) => None,
        };
        let Some(reset_at) = reset_at else {
            continue;
        };
        if tracker.record_from_response(category, limit, entry.remaining, reset_at) {
            recorded.push(category);
        }
    }
    recorded.sort_by_key(|c| c.as_str());
    recorded
}

/// Refetch authoritative quotas from the status endpoint.
pub async fn fetch_quota_status(
    client: &Client,
    cfg: &Config,
    tracker: &RateLimitTracker,
) -> Result<Vec<RateLimitCategory>, ErrorInfo> {
    let url = cfg.endpoint(&cfg.status_path).map_err(|message| ErrorInfo {
        code: "bad_request".into(),
        message,
        retriable: false,
    })?;
    let mut attempt: u32 = 0;
    loop {
        let mut req = client
            .get(&url)
            .header(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(auth) = cfg.token.as_deref().and_then(auth_header) {
            req = req.header(AUTHORIZATION, auth);
        }
        let res = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("GET {} error sending request: {}", url, e);
                if attempt < MAX_RETRIES {
                    tokio::time::sleep(compute_backoff(attempt, None)).await;
                    attempt += 1;
                    continue;
                }
                return Err(ErrorInfo {
                    code: "upstream_error".into(),
                    message: e.to_string(),
                    retriable: true,
                });
            }
        };
        let status = res.status();
        let retry_after = res
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        if status.is_server_error() && attempt < MAX_RETRIES {
            tokio::time::sleep(compute_backoff(attempt, retry_after)).await;
            attempt += 1;
            continue;
        }
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(map_status_to_error(status, text));
        }
        return match res.json::<StatusBody>().await {
            Ok(body) => Ok(apply_status_body(tracker, &body, cfg.reset_mode)),
            Err(e) => Err(ErrorInfo {
                code: "server_error".into(),
                message: e.to_string(),
                retriable: false,
            }),
        };
    }
}
