//! Refresh policy: decides, per call, whether to reuse or rebuild the context.
//!
//! Three states drive the decision:
//!
//! | State | Condition | Decision | Window | Next counter |
//! |-------|-----------|----------|--------|--------------|
//! | `NoCache` | no entry | refresh, no prior context | `N` | `STEP` |
//! | `Due` | `counter >= N` | refresh, prior = summary | `N` | `STEP` |
//! | `Fresh` | `counter < N` | reuse | `STEP + counter` | `min(counter + STEP, N)` |
//!
//! The reuse branch clamps at `N` so a due refresh is never skipped. A stored
//! counter above `N` (possible only when a caller lowers the per-call window)
//! counts as due.

use crate::config::RefreshConfig;
use crate::store::CacheEntry;

/// Where a conversation sits in the refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    NoCache,
    Fresh,
    Due,
}

impl RefreshState {
    pub fn classify(entry: Option<&CacheEntry>, threshold: usize) -> Self {
        match entry {
            None => RefreshState::NoCache,
            Some(e) if e.refresh_counter >= threshold => RefreshState::Due,
            Some(_) => RefreshState::Fresh,
        }
    }
}

impl std::fmt::Display for RefreshState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshState::NoCache => write!(f, "no_cache"),
            RefreshState::Fresh => write!(f, "fresh"),
            RefreshState::Due => write!(f, "due"),
        }
    }
}

/// What the coordinator must do for this call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Fetch `window` messages, merge them with `prior` through the
    /// summarizer, and store the result with `next_counter`.
    Refresh {
        window: usize,
        prior: Option<String>,
        next_counter: usize,
    },
    /// Fetch `window` messages for display only and store `summary`
    /// unchanged with `next_counter`.
    Reuse {
        window: usize,
        summary: String,
        next_counter: usize,
    },
}

impl Decision {
    /// Number of messages to request from the history service.
    pub fn window(&self) -> usize {
        match self {
            Decision::Refresh { window, .. } | Decision::Reuse { window, .. } => *window,
        }
    }

    /// Counter value to commit once the call succeeds.
    pub fn next_counter(&self) -> usize {
        match self {
            Decision::Refresh { next_counter, .. } | Decision::Reuse { next_counter, .. } => {
                *next_counter
            }
        }
    }

    pub fn is_refresh(&self) -> bool {
        matches!(self, Decision::Refresh { .. })
    }
}

/// Run the state machine for one call.
///
/// `refresh` must already be validated (`0 < step <= threshold`).
pub fn decide(entry: Option<&CacheEntry>, refresh: RefreshConfig) -> Decision {
    let RefreshConfig { threshold, step } = refresh;
    match (RefreshState::classify(entry, threshold), entry) {
        (RefreshState::Fresh, Some(e)) => Decision::Reuse {
            window: step + e.refresh_counter,
            summary: e.summary_text.clone(),
            next_counter: (e.refresh_counter + step).min(threshold),
        },
        (RefreshState::Due, Some(e)) => Decision::Refresh {
            window: threshold,
            prior: Some(e.summary_text.clone()),
            next_counter: step,
        },
        _ => Decision::Refresh {
            window: threshold,
            prior: None,
            next_counter: step,
        },
    }
}
