//! Client-side rate-limit tracking.
//!
//! [`tracker::RateLimitTracker`] caches per-category quota usage reported by the
//! API, predicts usage optimistically before actions are dispatched, and tells
//! callers when cached numbers must be refetched. [`http`] bridges it to
//! `X-RateLimit-*` response headers; [`server`] hosts it as a stdio sidecar.

pub mod cli;
pub mod clock;
pub mod config;
pub mod errors;
pub mod http;
pub mod mcp;
pub mod server;
pub mod tools;
pub mod tracker;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::QuotaError;
pub use tracker::RateLimitTracker;
pub use types::{EntrySource, QuotaEntry, QuotaState, QuotaStatus, RateLimitCategory};
