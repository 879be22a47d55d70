//! Per-category quota cache.
//!
//! Server responses overwrite an entry outright; local actions decrement it
//! optimistically until the next server response replaces it. Each category
//! lives in its own mutex slot, so categories never contend with each other.

use crate::clock::{Clock, SystemClock};
use crate::errors::QuotaError;
use crate::types::{EntrySource, QuotaEntry, QuotaState, QuotaStatus, RateLimitCategory};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard};

pub struct RateLimitTracker {
    slots: [Mutex<Option<QuotaEntry>>; RateLimitCategory::COUNT],
    clock: Arc<dyn Clock>,
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("entries", &self.snapshot())
            .finish()
    }
}

impl RateLimitTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: std::array::from_fn(|_| Mutex::new(None)),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // A panic in another holder cannot leave a slot half-written: every write
    // replaces the whole entry or mutates plain integers.
    fn slot(&self, category: RateLimitCategory) -> MutexGuard<'_, Option<QuotaEntry>> {
        self.slots[category.index()]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Authoritative overwrite from server metadata.
    ///
    /// Returns `false` and leaves any existing entry untouched when the input is
    /// unusable (negative limit, reset boundary not in the future).
    pub fn record_from_response(
        &self,
        category: RateLimitCategory,
        limit: i64,
        remaining: i64,
        reset_at: DateTime<Utc>,
    ) -> bool {
        let now = self.clock.now();
        if limit < 0 {
            warn!("ignoring {} quota update with negative limit {}", category, limit);
            return false;
        }
        if reset_at <= now {
            warn!(
                "ignoring {} quota update with past reset {} (now {})",
                category, reset_at, now
            );
            return false;
        }
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        let remaining = u32::try_from(remaining.max(0))
            .unwrap_or(u32::MAX)
            .min(limit);
        let entry = QuotaEntry {
            state: QuotaState {
                limit,
                remaining,
                reset_at,
            },
            source: EntrySource::Authoritative,
            fetched_at: now,
            invalidated: false,
            pending_decrements: 0,
        };
        debug!(
            "{} quota recorded: {}/{} until {}",
            category, remaining, limit, reset_at
        );
        *self.slot(category) = Some(entry);
        true
    }

    /// Reconcile a 429: nothing remains in this window.
    ///
    /// A future `reset_hint` becomes the new boundary. Without one the cached
    /// boundary is kept but the entry is invalidated so the next read refetches.
    /// With no prior entry and no hint nothing is recorded.
    pub fn record_rate_limited(
        &self,
        category: RateLimitCategory,
        limit: Option<i64>,
        reset_hint: Option<DateTime<Utc>>,
    ) -> bool {
        let now = self.clock.now();
        let hint = reset_hint.filter(|at| *at > now);
        let limit = limit
            .filter(|l| *l >= 0)
            .map(|l| u32::try_from(l).unwrap_or(u32::MAX));
        let mut slot = self.slot(category);
        let next = match (slot.as_ref(), hint) {
            (Some(prev), Some(at)) => QuotaEntry {
                state: QuotaState {
                    limit: limit.unwrap_or(prev.state.limit),
                    remaining: 0,
                    reset_at: at,
                },
                source: EntrySource::Authoritative,
                fetched_at: now,
                invalidated: false,
                pending_decrements: 0,
            },
            (Some(prev), None) => QuotaEntry {
                state: QuotaState {
                    limit: limit.unwrap_or(prev.state.limit),
                    remaining: 0,
                    reset_at: prev.state.reset_at,
                },
                source: EntrySource::Authoritative,
                fetched_at: now,
                invalidated: true,
                pending_decrements: 0,
            },
            (None, Some(at)) => QuotaEntry {
                state: QuotaState {
                    limit: limit.unwrap_or(0),
                    remaining: 0,
                    reset_at: at,
                },
                source: EntrySource::Authoritative,
                fetched_at: now,
                invalidated: false,
                pending_decrements: 0,
            },
            (None, None) => {
                warn!("{} rate limited with no reset hint and no cached window", category);
                return false;
            }
        };
        warn!(
            "{} rate limited; window resets {}{}",
            category,
            next.state.reset_at,
            if next.invalidated { " (unconfirmed)" } else { "" }
        );
        *slot = Some(next);
        true
    }

    /// Classify the cached entry for `category`.
    pub fn status(&self, category: RateLimitCategory) -> QuotaStatus {
        let now = self.clock.now();
        match self.slot(category).clone() {
            None => QuotaStatus::Unknown,
            Some(entry) if entry.is_fresh(now) => QuotaStatus::Fresh { entry },
            Some(entry) => QuotaStatus::Stale { entry },
        }
    }

    /// Freshest known quota. Stale and missing entries come back as errors so
    /// callers refetch instead of trusting them.
    pub fn get_quota(&self, category: RateLimitCategory) -> Result<QuotaEntry, QuotaError> {
        match self.status(category) {
            QuotaStatus::Fresh { entry } => Ok(entry),
            QuotaStatus::Stale { entry } => Err(QuotaError::StaleData {
                category,
                entry: Box::new(entry),
            }),
            QuotaStatus::Unknown => Err(QuotaError::UnknownCategory { category }),
        }
    }

    pub fn needs_refresh(&self, category: RateLimitCategory) -> bool {
        !matches!(self.status(category), QuotaStatus::Fresh { .. })
    }

    /// Predict the effect of an action about to be dispatched.
    ///
    /// `remaining` floors at zero; `limit` and `reset_at` are untouched. No-op
    /// for a category with nothing cached.
    pub fn apply_optimistic_decrement(&self, category: RateLimitCategory, cost: u32) -> bool {
        let mut slot = self.slot(category);
        let Some(entry) = slot.as_mut() else {
            debug!("no cached {} quota to decrement", category);
            return false;
        };
        entry.state.remaining = entry.state.remaining.saturating_sub(cost);
        entry.pending_decrements = entry.pending_decrements.saturating_add(cost);
        entry.source = EntrySource::Optimistic;
        debug!(
            "{} optimistic decrement by {}: {} remaining",
            category, cost, entry.state.remaining
        );
        true
    }

    /// Force the next read of `category` to report stale.
    pub fn invalidate(&self, category: RateLimitCategory) -> bool {
        let mut slot = self.slot(category);
        match slot.as_mut() {
            Some(entry) => {
                entry.invalidated = true;
                debug!("{} quota invalidated", category);
                true
            }
            None => false,
        }
    }

    /// Drop the entry so the category reads as unknown again.
    pub fn forget(&self, category: RateLimitCategory) {
        *self.slot(category) = None;
    }

    pub fn clear(&self) {
        for cat in RateLimitCategory::ALL {
            self.forget(cat);
        }
    }

    /// Status of every category, in declaration order.
    pub fn snapshot(&self) -> Vec<(RateLimitCategory, QuotaStatus)> {
        RateLimitCategory::ALL
            .iter()
            .map(|cat| (*cat, self.status(*cat)))
            .collect()
    }
}
