use chrono::{DateTime, Duration, Utc};
use quota_tracker::config::ResetMode;
use quota_tracker::http::{extract_rate_headers, map_status_to_error, reconcile, Reconciled};
use quota_tracker::{ManualClock, RateLimitCategory, RateLimitTracker};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::sync::Arc;

fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
}

#[test]
fn status_error_mapping() {
    let e = map_status_to_error(StatusCode::TOO_MANY_REQUESTS, "rate".into());
    assert_eq!(e.code, "rate_limited");
    assert!(e.retriable);
    let e = map_status_to_error(StatusCode::UNAUTHORIZED, "no".into());
    assert_eq!(e.code, "unauthorized");
    assert!(!e.retriable);
}

#[test]
fn rest_rate_headers_feed_tracker() {
    let tracker = RateLimitTracker::new(Arc::new(ManualClock::new(t0())));
    let mut h = HeaderMap::new();
    h.insert("x-ratelimit-limit", "10".parse().unwrap());
    h.insert("x-ratelimit-remaining", "6".parse().unwrap());
    h.insert("x-ratelimit-reset", "1700003600".parse().unwrap());
    let rate = extract_rate_headers(&h, t0());
    assert_eq!(rate.limit, Some(10));
    assert_eq!(rate.remaining, Some(6));

    let cat = RateLimitCategory::SvgConversion;
    assert_eq!(
        reconcile(&tracker, cat, StatusCode::OK, &rate, ResetMode::Epoch),
        Reconciled::Recorded
    );
    let entry = tracker.get_quota(cat).unwrap();
    assert_eq!(entry.state.limit, 10);
    assert_eq!(entry.state.remaining, 6);
    assert_eq!(entry.state.reset_at, t0() + Duration::hours(1));
}

#[test]
fn relative_reset_mode() {
    let tracker = RateLimitTracker::new(Arc::new(ManualClock::new(t0())));
    let mut h = HeaderMap::new();
    h.insert("x-ratelimit-limit", "5".parse().unwrap());
    h.insert("x-ratelimit-remaining", "5".parse().unwrap());
    h.insert("x-ratelimit-reset", "90".parse().unwrap());
    let rate = extract_rate_headers(&h, t0());
    let cat = RateLimitCategory::ExportAction;
    reconcile(&tracker, cat, StatusCode::OK, &rate, ResetMode::Relative);
    assert_eq!(
        tracker.get_quota(cat).unwrap().state.reset_at,
        t0() + Duration::seconds(90)
    );
}

#[test]
fn rate_limited_response_uses_retry_after() {
    let clock = Arc::new(ManualClock::new(t0()));
    let tracker = RateLimitTracker::new(clock.clone());
    let cat = RateLimitCategory::GenerateConcept;
    tracker.record_from_response(cat, 10, 4, t0() + Duration::hours(1));

    let mut h = HeaderMap::new();
    h.insert("retry-after", "120".parse().unwrap());
    let rate = extract_rate_headers(&h, t0());
    assert_eq!(
        reconcile(&tracker, cat, StatusCode::TOO_MANY_REQUESTS, &rate, ResetMode::Epoch),
        Reconciled::RateLimited
    );
    let entry = tracker.get_quota(cat).unwrap();
    assert_eq!(entry.state.remaining, 0);
    assert_eq!(entry.state.reset_at, t0() + Duration::seconds(120));

    clock.advance(Duration::seconds(120));
    assert_eq!(tracker.get_quota(cat).unwrap_err().code(), "stale_data");
}
