use crate::types::{QuotaEntry, RateLimitCategory};
use thiserror::Error;

/// Why a quota read could not be trusted. Both kinds are recovered by fetching from the server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// The window boundary has passed or the entry was invalidated.
    #[error("quota for {category} is stale; refetch before trusting it")]
    StaleData {
        category: RateLimitCategory,
        /// Last known values, for display only.
        entry: Box<QuotaEntry>,
    },

    /// No server response for this category has been observed yet.
    #[error("no quota recorded for {category}; fetch before first use")]
    UnknownCategory { category: RateLimitCategory },
}

impl QuotaError {
    pub fn code(&self) -> &'static str {
        match self {
            QuotaError::StaleData { .. } => "stale_data",
            QuotaError::UnknownCategory { .. } => "unknown_category",
        }
    }

    pub fn category(&self) -> RateLimitCategory {
        match self {
            QuotaError::StaleData { category, .. } | QuotaError::UnknownCategory { category } => {
                *category
            }
        }
    }

    pub fn last_known(&self) -> Option<&QuotaEntry> {
        match self {
            QuotaError::StaleData { entry, .. } => Some(entry),
            QuotaError::UnknownCategory { .. } => None,
        }
    }
}
