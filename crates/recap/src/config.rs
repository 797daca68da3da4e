//! Configuration for the context cache.
//!
//! Every knob has a default, a `with_*` builder, and a `RECAP_*` environment
//! variable. Configuration is validated once, when the
//! [`ContextCache`](crate::coordinator::ContextCache) is built; an invalid
//! threshold means the cache is never constructed.
//!
//! ```
//! use recap::config::{RecapConfig, RefreshConfig};
//!
//! let config = RecapConfig::default().with_refresh(RefreshConfig::new(6, 3));
//! assert!(config.validate().is_ok());
//!
//! let bad = RecapConfig::default().with_refresh(RefreshConfig::new(2, 3));
//! assert!(bad.validate().is_err());
//! ```

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryConfig;

/// Default window threshold `N`.
pub const DEFAULT_THRESHOLD: usize = 4;
/// Default counter increment and post-refresh baseline `STEP`.
pub const DEFAULT_STEP: usize = 2;
/// Default maximum number of cached conversations.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;
/// Default idle time after which a cached conversation expires.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ── Refresh thresholds ────────────────────────────────────────────

/// Window threshold and step driving the refresh policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshConfig {
    /// Counter value at which a refresh fires; also the refresh window size.
    pub threshold: usize,
    /// Counter advance per reuse and the counter baseline after a refresh.
    pub step: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            step: DEFAULT_STEP,
        }
    }
}

impl RefreshConfig {
    pub fn new(threshold: usize, step: usize) -> Self {
        Self { threshold, step }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        if self.step == 0 {
            return Err(ConfigError::ZeroStep);
        }
        if self.step > self.threshold {
            return Err(ConfigError::StepExceedsThreshold {
                step: self.step,
                threshold: self.threshold,
            });
        }
        Ok(())
    }
}

// ── Store bounds ──────────────────────────────────────────────────

/// Bounds for the in-memory cache store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Maximum number of conversations held before the least recently
    /// touched one is evicted.
    pub max_entries: usize,
    /// Idle time after which an entry reads as absent. `None` disables expiry.
    pub ttl: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: Some(DEFAULT_TTL),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

// ── Timeouts ──────────────────────────────────────────────────────

/// Upper bounds on each external call made during `get_context`.
///
/// These bound the whole call as the cache sees it, adapter retries
/// included. See [`RecapConfig::with_retry_budget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Bound on one history fetch.
    pub fetch: Duration,
    /// Bound on one summarizer call.
    pub completion: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fetch: Duration::from_secs(10),
            completion: Duration::from_secs(120),
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch.is_zero() {
            return Err(ConfigError::ZeroTimeout("fetch"));
        }
        if self.completion.is_zero() {
            return Err(ConfigError::ZeroTimeout("completion"));
        }
        Ok(())
    }
}

// ── Bundle ────────────────────────────────────────────────────────

/// Complete configuration for a [`ContextCache`](crate::coordinator::ContextCache).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecapConfig {
    pub refresh: RefreshConfig,
    pub store: StoreConfig,
    pub timeouts: TimeoutConfig,
}

impl RecapConfig {
    pub fn with_refresh(mut self, refresh: RefreshConfig) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.store.max_entries = max_entries;
        self
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.store.ttl = ttl;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.fetch = timeout;
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.completion = timeout;
        self
    }

    /// Widen both timeouts to cover every attempt `retry` allows.
    ///
    /// Treats the current values as per-attempt bounds (the ones handed to
    /// the HTTP adapters) and replaces them with the total budget, so a
    /// timed-out attempt can still be retried before the cache gives up.
    pub fn with_retry_budget(mut self, retry: &RetryConfig) -> Self {
        self.timeouts.fetch = retry.budget(self.timeouts.fetch);
        self.timeouts.completion = retry.budget(self.timeouts.completion);
        self
    }

    /// Check every section. Called by `ContextCache::new`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.refresh.validate()?;
        self.store.validate()?;
        self.timeouts.validate()
    }

    /// Load from `RECAP_*` environment variables, falling back to defaults
    /// for unset variables, then validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    ///
    /// `RECAP_TTL_SECS=0` disables expiry.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let threshold = parse_var(&lookup, "RECAP_THRESHOLD")?.unwrap_or(defaults.refresh.threshold);
        let step = parse_var(&lookup, "RECAP_STEP")?.unwrap_or(defaults.refresh.step);
        let max_entries =
            parse_var(&lookup, "RECAP_MAX_ENTRIES")?.unwrap_or(defaults.store.max_entries);
        let ttl = match parse_var::<u64>(&lookup, "RECAP_TTL_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.store.ttl,
        };
        let fetch = parse_var(&lookup, "RECAP_FETCH_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeouts.fetch);
        let completion = parse_var(&lookup, "RECAP_COMPLETION_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeouts.completion);

        let config = Self {
            refresh: RefreshConfig::new(threshold, step),
            store: StoreConfig { max_entries, ttl },
            timeouts: TimeoutConfig { fetch, completion },
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}
