use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A class of quota-bound operation. Keys match the backend limiter names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitCategory {
    GenerateConcept,
    RefineConcept,
    StoreConcept,
    GetConcepts,
    Sessions,
    SvgConversion,
    ExportAction,
}

impl RateLimitCategory {
    pub const COUNT: usize = 7;

    pub const ALL: [RateLimitCategory; Self::COUNT] = [
        RateLimitCategory::GenerateConcept,
        RateLimitCategory::RefineConcept,
        RateLimitCategory::StoreConcept,
        RateLimitCategory::GetConcepts,
        RateLimitCategory::Sessions,
        RateLimitCategory::SvgConversion,
        RateLimitCategory::ExportAction,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitCategory::GenerateConcept => "generate_concept",
            RateLimitCategory::RefineConcept => "refine_concept",
            RateLimitCategory::StoreConcept => "store_concept",
            RateLimitCategory::GetConcepts => "get_concepts",
            RateLimitCategory::Sessions => "sessions",
            RateLimitCategory::SvgConversion => "svg_conversion",
            RateLimitCategory::ExportAction => "export_action",
        }
    }

    /// Slot index in the tracker's fixed table.
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RateLimitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCategoryName(pub String);

impl fmt::Display for UnknownCategoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown rate limit category: {}", self.0)
    }
}

impl std::error::Error for UnknownCategoryName {}

impl FromStr for RateLimitCategory {
    type Err = UnknownCategoryName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace('-', "_");
        let cat = match key.as_str() {
            "generate_concept" | "generation" => RateLimitCategory::GenerateConcept,
            "refine_concept" | "refinement" => RateLimitCategory::RefineConcept,
            "store_concept" => RateLimitCategory::StoreConcept,
            "get_concepts" => RateLimitCategory::GetConcepts,
            "sessions" => RateLimitCategory::Sessions,
            "svg_conversion" => RateLimitCategory::SvgConversion,
            "export_action" | "export" => RateLimitCategory::ExportAction,
            _ => return Err(UnknownCategoryName(s.to_string())),
        };
        Ok(cat)
    }
}

/// Quota usage for one category in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub limit: u32,
    /// `<= limit` for every entry the tracker writes.
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl QuotaState {
    pub fn used(&self) -> u32 {
        self.limit.saturating_sub(self.remaining)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Time left in the window; zero once `reset_at` has passed.
    pub fn resets_in(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).max(Duration::zero())
    }
}

/// Where the cached numbers came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// Written from a real server response.
    Authoritative,
    /// Locally predicted before the server confirmed the outcome.
    Optimistic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEntry {
    pub state: QuotaState,
    pub source: EntrySource,
    pub fetched_at: DateTime<Utc>,
    /// Set by `invalidate` or by a 429 without a reset hint.
    pub invalidated: bool,
    /// Optimistic cost applied since the last authoritative write.
    pub pending_decrements: u32,
}

impl QuotaEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        !self.invalidated && now < self.state.reset_at
    }
}

/// Read-side classification used by quota panels and the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QuotaStatus {
    Fresh { entry: QuotaEntry },
    Stale { entry: QuotaEntry },
    Unknown,
}

/// Human-readable countdown, e.g. "5 minutes" or "2 hours 10 minutes".
pub fn format_resets_in(d: Duration) -> String {
    let secs = d.num_seconds().max(0);
    if secs < 60 {
        return plural(secs, "second");
    }
    let mins = secs / 60;
    if mins < 60 {
        return plural(mins, "minute");
    }
    let hours = mins / 60;
    let rem = mins % 60;
    if hours < 24 {
        if rem == 0 {
            return plural(hours, "hour");
        }
        return format!("{} {}", plural(hours, "hour"), plural(rem, "minute"));
    }
    plural(hours / 24, "day")
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    }
}
