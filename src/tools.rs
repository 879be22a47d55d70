use crate::types::{QuotaStatus, RateLimitCategory};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

fn category_schema() -> serde_json::Value {
    let keys: Vec<&str> = RateLimitCategory::ALL.iter().map(|c| c.as_str()).collect();
    serde_json::json!({"type": "string", "enum": keys})
}

fn tool(name: &str, description: &str, input_schema: serde_json::Value) -> ToolDescriptor {
    ToolDescriptor {
        name: name.into(),
        description: description.into(),
        input_schema,
    }
}

pub fn tool_descriptors() -> Vec<ToolDescriptor> {
    let category = category_schema();
    vec![
        tool(
            "record_response",
            "Record rate-limit metadata from a completed response (authoritative overwrite)",
            serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "category": category,
                    "limit": {"type": "integer"},
                    "remaining": {"type": "integer"},
                    "reset": {
                        "type": "integer",
                        "description": "X-RateLimit-Reset value, read per QUOTA_RESET_MODE"
                    }
                },
                "required": ["category", "limit", "remaining", "reset"]
            }),
        ),
        tool(
            "record_rate_limited",
            "Record a 429 for a category; remaining drops to zero",
            serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "category": category,
                    "limit": {"type": "integer"},
                    "retry_after_secs": {"type": "integer"}
                },
                "required": ["category"]
            }),
        ),
        tool(
            "apply_optimistic_decrement",
            "Predict quota use before dispatching an action",
            serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "category": category,
                    "cost": {"type": "integer", "minimum": 0}
                },
                "required": ["category"]
            }),
        ),
        tool(
            "invalidate",
            "Mark a category stale so the next read refetches",
            serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": { "category": category },
                "required": ["category"]
            }),
        ),
        tool(
            "get_quota",
            "Read the cached quota for a category",
            serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": { "category": category },
                "required": ["category"]
            }),
        ),
        tool(
            "list_quotas",
            "Status of every category",
            serde_json::json!({"type": "object", "additionalProperties": false, "properties": {}}),
        ),
        tool(
            "refresh_quotas",
            "Refetch authoritative quotas from the API status endpoint",
            serde_json::json!({"type": "object", "additionalProperties": false, "properties": {}}),
        ),
        tool(
            "tracked_request",
            "Send a quota-consuming request: decrement, dispatch, reconcile",
            serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "category": category,
                    "method": {"type": "string", "enum": ["GET", "POST", "PUT", "PATCH", "DELETE"]},
                    "path": {"type": "string"},
                    "body": {},
                    "cost": {"type": "integer", "minimum": 0}
                },
                "required": ["category", "path"]
            }),
        ),
    ]
}

fn default_cost() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct RecordResponseInput {
    pub category: RateLimitCategory,
    pub limit: i64,
    pub remaining: i64,
    pub reset: i64,
}

#[derive(Debug, Deserialize)]
pub struct RecordRateLimitedInput {
    pub category: RateLimitCategory,
    pub limit: Option<i64>,
    pub retry_after_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DecrementInput {
    pub category: RateLimitCategory,
    #[serde(default = "default_cost")]
    pub cost: u32,
}

#[derive(Debug, Deserialize)]
pub struct CategoryInput {
    pub category: RateLimitCategory,
}

#[derive(Debug, Deserialize)]
pub struct TrackedRequestInput {
    pub category: RateLimitCategory,
    pub method: Option<String>,
    pub path: String,
    pub body: Option<serde_json::Value>,
    #[serde(default = "default_cost")]
    pub cost: u32,
}

#[derive(Debug, Serialize)]
pub struct WriteOutput {
    pub category: RateLimitCategory,
    pub applied: bool,
}

#[derive(Debug, Serialize)]
pub struct QuotaOutput {
    pub category: RateLimitCategory,
    #[serde(flatten)]
    pub status: QuotaStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resets_in: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListOutput {
    pub items: Vec<QuotaOutput>,
}

#[derive(Debug, Serialize)]
pub struct RefreshOutput {
    pub recorded: Vec<RateLimitCategory>,
}
