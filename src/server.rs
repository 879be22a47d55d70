use crate::clock::SystemClock;
use crate::config::{Config, ResetMode};
use crate::errors::QuotaError;
use crate::http::{self, TrackedRequest};
use crate::mcp::{mcp_error, mcp_wrap};
use crate::tools::*;
use crate::tracker::RateLimitTracker;
use crate::types::{format_resets_in, QuotaStatus, RateLimitCategory};
use log::{debug, info, warn};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use uuid::Uuid;

// Minimal JSON-RPC 2.0 types
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Id {
    Str(String),
    Num(i64),
    Null,
}

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    id: Option<Id>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    id: Option<Id>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

fn rpc_error(id: Option<Id>, code: i64, message: &str, data: Option<Value>) -> Response {
    Response {
        jsonrpc: "2.0".into(),
        result: None,
        error: Some(RpcError {
            code,
            message: message.into(),
            data,
        }),
        id,
    }
}

fn rpc_ok(id: Option<Id>, result: Value) -> Response {
    Response {
        jsonrpc: "2.0".into(),
        result: Some(result),
        error: None,
        id,
    }
}

/// One sidecar session: a tracker that lives as long as stdin stays open.
pub struct Session {
    id: Uuid,
    tracker: Arc<RateLimitTracker>,
    config: Option<Config>,
    client: Option<reqwest::Client>,
    runtime: tokio::runtime::Runtime,
}

impl Session {
    pub fn new(tracker: Arc<RateLimitTracker>) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            id: Uuid::new_v4(),
            tracker,
            config: None,
            client: None,
            runtime,
        })
    }

    // Config is only needed by tools that talk to the API.
    fn http(&mut self) -> Result<(Config, reqwest::Client), String> {
        if self.config.is_none() {
            self.config = Some(Config::from_env()?);
        }
        let cfg = self.config.clone().ok_or("configuration unavailable")?;
        if self.client.is_none() {
            self.client = Some(http::build_client(&cfg).map_err(|e| e.to_string())?);
        }
        let client = self.client.clone().ok_or("http client unavailable")?;
        Ok((cfg, client))
    }

    // Local writes only depend on QUOTA_RESET_MODE, never on the API settings.
    fn reset_mode(&self) -> Result<ResetMode, String> {
        match &self.config {
            Some(cfg) => Ok(cfg.reset_mode),
            None => ResetMode::from_env(),
        }
    }

    fn dispatch(&mut self, req: Request) -> Response {
        match req.method.as_str() {
            "initialize" => self.handle_initialize(req.id),
            "tools/list" => handle_tools_list(req.id),
            "tools/call" => self.handle_tools_call(req.id, req.params),
            "ping" => rpc_ok(req.id, serde_json::json!({})),
            other => rpc_error(req.id, -32601, &format!("Method not found: {}", other), None),
        }
    }

    fn handle_initialize(&self, id: Option<Id>) -> Response {
        rpc_ok(
            id,
            serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {
                    "name": "quota-tracker",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": { "tools": {} },
                "session": self.id.to_string(),
            }),
        )
    }

    fn handle_tools_call(&mut self, id: Option<Id>, params: Value) -> Response {
        #[derive(Deserialize)]
        struct ToolCallParams {
            name: String,
            #[serde(default)]
            arguments: Value,
        }
        let Ok(call) = serde_json::from_value::<ToolCallParams>(params) else {
            return rpc_error(id, -32602, "Invalid params", None);
        };
        debug!("tools/call name={}", call.name);
        let result = match call.name.as_str() {
            "record_response" => self.record_response(call.arguments),
            "record_rate_limited" => self.record_rate_limited(call.arguments),
            "apply_optimistic_decrement" => self.apply_optimistic_decrement(call.arguments),
            "invalidate" => self.invalidate(call.arguments),
            "get_quota" => self.get_quota(call.arguments),
            "list_quotas" => Ok(self.list_quotas()),
            "refresh_quotas" => self.refresh_quotas(),
            "tracked_request" => self.tracked_request(call.arguments),
            _ => return rpc_error(id, -32601, &format!("Tool not found: {}", call.name), None),
        };
        match result {
            Ok(v) => rpc_ok(id, v),
            Err(CallError::Params(msg)) => {
                rpc_error(id, -32602, &format!("Invalid params: {}", msg), None)
            }
            Err(CallError::Internal(msg)) => rpc_error(id, -32603, &msg, None),
        }
    }

    fn record_response(&mut self, args: Value) -> Result<Value, CallError> {
        let input: RecordResponseInput = parse_args(args)?;
        let mode = self.reset_mode().map_err(CallError::Internal)?;
        let now = self.tracker.now();
        let applied = match http::resolve_reset(input.reset, mode, now) {
            Some(reset_at) => self.tracker.record_from_response(
                input.category,
                input.limit,
                input.remaining,
                reset_at,
            ),
            None => false,
        };
        Ok(write_output(input.category, applied))
    }

    fn record_rate_limited(&mut self, args: Value) -> Result<Value, CallError> {
        let input: RecordRateLimitedInput = parse_args(args)?;
        let now = self.tracker.now();
        let hint = input
            .retry_after_secs
            .and_then(|s| http::offset_secs(now, s.max(0)));
        let applied = self
            .tracker
            .record_rate_limited(input.category, input.limit, hint);
        Ok(write_output(input.category, applied))
    }

    fn apply_optimistic_decrement(&mut self, args: Value) -> Result<Value, CallError> {
        let input: DecrementInput = parse_args(args)?;
        let applied = self
            .tracker
            .apply_optimistic_decrement(input.category, input.cost);
        Ok(write_output(input.category, applied))
    }

    fn invalidate(&mut self, args: Value) -> Result<Value, CallError> {
        let input: CategoryInput = parse_args(args)?;
        let applied = self.tracker.invalidate(input.category);
        Ok(write_output(input.category, applied))
    }

    fn get_quota(&mut self, args: Value) -> Result<Value, CallError> {
        let input: CategoryInput = parse_args(args)?;
        match self.tracker.get_quota(input.category) {
            Ok(entry) => {
                let out = self.quota_output(input.category, QuotaStatus::Fresh { entry });
                Ok(mcp_wrap(to_value(&out), None, false))
            }
            Err(e) => Ok(quota_error(&e)),
        }
    }

    fn list_quotas(&self) -> Value {
        let items = self
            .tracker
            .snapshot()
            .into_iter()
            .map(|(cat, status)| self.quota_output(cat, status))
            .collect();
        mcp_wrap(to_value(&ListOutput { items }), None, false)
    }

    fn refresh_quotas(&mut self) -> Result<Value, CallError> {
        let (cfg, client) = self.http().map_err(CallError::Internal)?;
        let tracker = self.tracker.clone();
        let res = self
            .runtime
            .block_on(async move { http::fetch_quota_status(&client, &cfg, &tracker).await });
        Ok(match res {
            Ok(recorded) => {
                info!("refreshed {} quota categories", recorded.len());
                mcp_wrap(to_value(&RefreshOutput { recorded }), None, false)
            }
            Err(e) => mcp_error(&e.code, &e.message, None),
        })
    }

    fn tracked_request(&mut self, args: Value) -> Result<Value, CallError> {
        let input: TrackedRequestInput = parse_args(args)?;
        let method = match input.method.as_deref() {
            None => Method::POST,
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|e| CallError::Params(e.to_string()))?,
        };
        let (cfg, client) = self.http().map_err(CallError::Internal)?;
        let tracker = self.tracker.clone();
        let category = input.category;
        let res = self.runtime.block_on(async {
            http::send_tracked(
                &client,
                &cfg,
                &tracker,
                TrackedRequest {
                    category,
                    method,
                    path: &input.path,
                    body: input.body.as_ref(),
                    cost: input.cost,
                },
            )
            .await
        });
        let quota = self.quota_output(category, self.tracker.status(category));
        let structured = serde_json::json!({
            "status": res.status.as_u16(),
            "reconciled": res.reconciled,
            "body": res.body,
            "quota": quota,
        });
        Ok(match res.error {
            None => mcp_wrap(structured, None, false),
            Some(err) => {
                let mut v = structured;
                if let Some(map) = v.as_object_mut() {
                    map.insert("error".into(), to_value(&err));
                }
                mcp_wrap(v, Some(format!("{}: {}", err.code, err.message)), true)
            }
        })
    }

    fn quota_output(&self, category: RateLimitCategory, status: QuotaStatus) -> QuotaOutput {
        let now = self.tracker.now();
        let resets_in = match &status {
            QuotaStatus::Fresh { entry } => Some(format_resets_in(entry.state.resets_in(now))),
            _ => None,
        };
        QuotaOutput {
            category,
            status,
            resets_in,
        }
    }
}

enum CallError {
    Params(String),
    Internal(String),
}

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, CallError> {
    serde_json::from_value(args).map_err(|e| CallError::Params(e.to_string()))
}

fn to_value<T: Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

fn write_output(category: RateLimitCategory, applied: bool) -> Value {
    mcp_wrap(to_value(&WriteOutput { category, applied }), None, false)
}

fn quota_error(e: &QuotaError) -> Value {
    let mut extra = serde_json::json!({ "category": e.category() });
    if let (Some(map), Some(entry)) = (extra.as_object_mut(), e.last_known()) {
        map.insert("last_known".into(), to_value(entry));
    }
    mcp_error(e.code(), &e.to_string(), Some(extra))
}

fn handle_tools_list(id: Option<Id>) -> Response {
    let tools = tool_descriptors();
    rpc_ok(id, serde_json::json!({ "tools": tools }))
}

fn write_response(out: &mut impl Write, resp: &Response) -> anyhow::Result<()> {
    let payload = serde_json::to_string(resp)?;
    writeln!(out, "{}", payload)?;
    out.flush()?;
    Ok(())
}

/// Serve newline-delimited JSON-RPC requests until stdin closes.
pub fn run_stdio_server() -> anyhow::Result<()> {
    let tracker = Arc::new(RateLimitTracker::new(Arc::new(SystemClock)));
    let mut session = Session::new(tracker)?;
    info!(
        "Starting quota-tracker stdio server; session={} protocol={}",
        session.id, PROTOCOL_VERSION
    );
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let resp = match serde_json::from_str::<Request>(&line) {
            Ok(req) => {
                debug!("Received method={}", req.method);
                session.dispatch(req)
            }
            Err(e) => {
                warn!("unparseable request: {}", e);
                rpc_error(None, -32700, &format!("Parse error: {}", e), None)
            }
        };
        write_response(&mut stdout, &resp)?;
    }
    info!("stdin closed; ending session {}", session.id);
    Ok(())
}
