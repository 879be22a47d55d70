use assert_cmd::Command;
use httpmock::{Method::GET, Method::POST, MockServer};
use quota_tracker::config::Config;
use quota_tracker::http::{
    build_client, fetch_quota_status, send_tracked, Reconciled, TrackedRequest, MAX_RETRIES,
};
use quota_tracker::{EntrySource, RateLimitCategory, RateLimitTracker};
use std::io::Write;

fn run_with_env(
    reqs: &[serde_json::Value],
    envs: &[(&str, &str)],
) -> anyhow::Result<Vec<serde_json::Value>> {
    let mut cmd = Command::cargo_bin("quota-tracker")?;
    for (k, v) in envs {
        cmd.env(k, v);
    }
    let mut input = Vec::new();
    for r in reqs {
        writeln!(input, "{}", serde_json::to_string(r)?)?;
    }
    let assert = cmd.arg("--log-level").arg("warn").write_stdin(input).assert();
    let output = String::from_utf8(assert.get_output().stdout.clone())?;
    output
        .lines()
        .map(|l| serde_json::from_str(l).map_err(Into::into))
        .collect()
}

fn call(id: i64, name: &str, arguments: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0", "method": "tools/call", "id": id,
        "params": {"name": name, "arguments": arguments}
    })
}

fn test_config(base_url: &str) -> Config {
    Config {
        api_url: base_url.to_string(),
        timeout_secs: 5,
        ..Config::default()
    }
}

#[test]
fn tracked_request_reconciles_from_headers() -> anyhow::Result<()> {
    let server = MockServer::start();
    let reset = (chrono::Utc::now().timestamp() + 3600).to_string();
    let m = server.mock(|when, then| {
        when.method(POST).path("/concepts/generate");
        then.status(200)
            .header("x-ratelimit-limit", "10")
            .header("x-ratelimit-remaining", "7")
            .header("x-ratelimit-reset", reset.as_str())
            .json_body(serde_json::json!({"id": "c1"}));
    });
    let request = serde_json::json!({
        "category": "generate_concept",
        "path": "/concepts/generate",
        "body": {"logo_description": "fox", "theme_description": "autumn"}
    });
    let out = run_with_env(
        &[
            call(1, "tracked_request", request),
            call(2, "get_quota", serde_json::json!({"category": "generate_concept"})),
        ],
        &[("QUOTA_API_URL", server.base_url().as_str())],
    )?;
    m.assert();
    let res = &out[0]["result"]["structuredContent"];
    assert_eq!(res["status"], 200);
    assert_eq!(res["reconciled"], "recorded");
    assert_eq!(res["body"]["id"], "c1");
    assert_eq!(res["quota"]["entry"]["state"]["remaining"], 7);
    let quota = &out[1]["result"]["structuredContent"];
    assert_eq!(quota["entry"]["source"], "authoritative");
    Ok(())
}

#[test]
fn tracked_request_429_zeroes_quota_without_retrying() -> anyhow::Result<()> {
    let server = MockServer::start();
    let m = server.mock(|when, then| {
        when.method(POST).path("/export/process");
        then.status(429)
            .header("retry-after", "30")
            .header("x-ratelimit-limit", "50")
            .body("Rate limit exceeded");
    });
    let reset = chrono::Utc::now().timestamp() + 3600;
    let seed = serde_json::json!({
        "category": "export_action", "limit": 50, "remaining": 2, "reset": reset
    });
    let request = serde_json::json!({"category": "export_action", "path": "/export/process"});
    let out = run_with_env(
        &[
            call(1, "record_response", seed),
            call(2, "tracked_request", request),
        ],
        &[("QUOTA_API_URL", server.base_url().as_str())],
    )?;
    m.assert_hits(1);
    let res = &out[1]["result"];
    assert_eq!(res["isError"], true);
    let sc = &res["structuredContent"];
    assert_eq!(sc["reconciled"], "rate_limited");
    assert_eq!(sc["error"]["code"], "rate_limited");
    assert_eq!(sc["quota"]["status"], "fresh");
    assert_eq!(sc["quota"]["entry"]["state"]["remaining"], 0);
    Ok(())
}

#[test]
fn refresh_quotas_from_status_endpoint() -> anyhow::Result<()> {
    let server = MockServer::start();
    let m = server.mock(|when, then| {
        when.method(GET)
            .path("/health/rate-limits-status")
            .header("authorization", "Bearer tok");
        then.status(200).json_body(serde_json::json!({
            "authenticated": true,
            "limits": {
                "generate_concept": {"limit": "10/month", "remaining": 4, "reset_after": 86400},
                "svg_conversion": {"limit": "20/hour", "remaining": 20, "reset_after": 1800}
            }
        }));
    });
    let out = run_with_env(
        &[
            call(1, "refresh_quotas", serde_json::json!({})),
            call(2, "get_quota", serde_json::json!({"category": "svg_conversion"})),
        ],
        &[
            ("QUOTA_API_URL", server.base_url().as_str()),
            ("QUOTA_API_TOKEN", "tok"),
        ],
    )?;
    m.assert();
    let recorded = out[0]["result"]["structuredContent"]["recorded"].clone();
    assert_eq!(
        recorded,
        serde_json::json!(["generate_concept", "svg_conversion"])
    );
    let quota = &out[1]["result"]["structuredContent"];
    assert_eq!(quota["entry"]["state"]["limit"], 20);
    Ok(())
}

#[tokio::test]
async fn send_tracked_keeps_optimistic_value_without_headers() {
    let server = MockServer::start_async().await;
    let _m = server
        .mock_async(|when, then| {
            when.method(POST).path("/concepts/refine");
            then.status(422).body("invalid prompt");
        })
        .await;
    let cfg = test_config(&server.base_url());
    let client = build_client(&cfg).unwrap();
    let tracker = RateLimitTracker::default();
    let cat = RateLimitCategory::RefineConcept;
    let reset = chrono::Utc::now() + chrono::Duration::hours(1);
    tracker.record_from_response(cat, 10, 5, reset);

    let res = send_tracked(
        &client,
        &cfg,
        &tracker,
        TrackedRequest {
            category: cat,
            method: reqwest::Method::POST,
            path: "/concepts/refine",
            body: None,
            cost: 1,
        },
    )
    .await;
    assert_eq!(res.status.as_u16(), 422);
    assert_eq!(res.reconciled, Reconciled::Ignored);
    assert_eq!(res.error.unwrap().code, "validation_error");
    let entry = tracker.get_quota(cat).unwrap();
    assert_eq!(entry.state.remaining, 4);
    assert_eq!(entry.source, EntrySource::Optimistic);
}

#[tokio::test]
async fn send_tracked_retries_server_errors_and_decrements_once() {
    let server = MockServer::start_async().await;
    let m = server
        .mock_async(|when, then| {
            when.method(POST).path("/concepts/generate");
            then.status(503).body("unavailable");
        })
        .await;
    let cfg = test_config(&server.base_url());
    let client = build_client(&cfg).unwrap();
    let tracker = RateLimitTracker::default();
    let cat = RateLimitCategory::GenerateConcept;
    let reset = chrono::Utc::now() + chrono::Duration::hours(1);
    tracker.record_from_response(cat, 10, 10, reset);

    let res = send_tracked(
        &client,
        &cfg,
        &tracker,
        TrackedRequest {
            category: cat,
            method: reqwest::Method::POST,
            path: "/concepts/generate",
            body: None,
            cost: 1,
        },
    )
    .await;
    assert_eq!(m.hits_async().await, (MAX_RETRIES + 1) as usize);
    assert_eq!(res.status.as_u16(), 503);
    let err = res.error.unwrap();
    assert_eq!(err.code, "upstream_error");
    assert!(err.retriable);
    let entry = tracker.get_quota(cat).unwrap();
    assert_eq!(entry.state.remaining, 9);
    assert_eq!(entry.pending_decrements, 1);
}

#[tokio::test]
async fn send_tracked_refuses_foreign_origin() {
    let api = MockServer::start_async().await;
    let foreign = MockServer::start_async().await;
    let leaked = foreign
        .mock_async(|when, then| {
            when.path("/collect");
            then.status(200);
        })
        .await;
    let cfg = Config {
        token: Some("secret".into()),
        ..test_config(&api.base_url())
    };
    let client = build_client(&cfg).unwrap();
    let tracker = RateLimitTracker::default();
    let cat = RateLimitCategory::ExportAction;
    let reset = chrono::Utc::now() + chrono::Duration::hours(1);
    tracker.record_from_response(cat, 50, 50, reset);

    let target = format!("{}/collect", foreign.base_url());
    let res = send_tracked(
        &client,
        &cfg,
        &tracker,
        TrackedRequest {
            category: cat,
            method: reqwest::Method::GET,
            path: &target,
            body: None,
            cost: 1,
        },
    )
    .await;
    assert_eq!(leaked.hits_async().await, 0);
    assert_eq!(res.status.as_u16(), 400);
    assert_eq!(res.error.unwrap().code, "bad_request");
    // A refused request never consumed quota.
    assert_eq!(tracker.get_quota(cat).unwrap().state.remaining, 50);
}

#[tokio::test]
async fn fetch_quota_status_reports_http_errors() {
    let server = MockServer::start_async().await;
    let _m = server
        .mock_async(|when, then| {
            when.method(GET).path("/health/rate-limits-status");
            then.status(401).body("unauthorized");
        })
        .await;
    let cfg = test_config(&server.base_url());
    let client = build_client(&cfg).unwrap();
    let tracker = RateLimitTracker::default();
    let err = fetch_quota_status(&client, &cfg, &tracker).await.unwrap_err();
    assert_eq!(err.code, "unauthorized");
    assert!(tracker.needs_refresh(RateLimitCategory::GenerateConcept));
}
