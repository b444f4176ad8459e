//! Engine configuration.
//!
//! Every knob has a default; `SyncConfig::from_env` overlays `FORGELIST_*`
//! variables on top of them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::priority::PlatformPriority;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Idle wait between drain passes when nothing wakes the dispatcher.
    pub poll_interval: Duration,
    /// Events executed concurrently.
    pub max_workers: usize,
    /// Pair lease lifetime; must outlive `call_timeout`.
    pub lease_ttl: Duration,
    /// Upper bound on one adapter call.
    pub call_timeout: Duration,
    /// Candidates fetched per pass.
    pub batch_size: usize,
    /// Lease holder name, for logs.
    pub name: String,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_workers: 8,
            lease_ttl: Duration::from_secs(120),
            call_timeout: Duration::from_secs(60),
            batch_size: 64,
            name: "dispatcher".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Heuristic matching of unlinked listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConfig {
    /// Maximum relative price difference, e.g. `0.05` for 5%.
    pub price_tolerance: f64,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            price_tolerance: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Time between scheduled passes of one platform.
    pub interval: Duration,
    pub snapshot_timeout: Duration,
    pub priority: PlatformPriority,
    pub heuristic: HeuristicConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            snapshot_timeout: Duration::from_secs(120),
            priority: PlatformPriority::default(),
            heuristic: HeuristicConfig::default(),
        }
    }
}

impl ReconcilerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_priority(mut self, priority: PlatformPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_price_tolerance(mut self, tolerance: f64) -> Self {
        self.heuristic.price_tolerance = tolerance;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub dispatcher: DispatcherConfig,
    pub reconciler: ReconcilerConfig,
    /// Simultaneous calls across all API adapters.
    pub api_concurrency: usize,
    /// Simultaneous browser sessions. Hard bound.
    pub browser_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            reconciler: ReconcilerConfig::default(),
            api_concurrency: 16,
            browser_concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot use `{value}`: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

impl SyncConfig {
    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_reconciler(mut self, reconciler: ReconcilerConfig) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn with_api_concurrency(mut self, n: usize) -> Self {
        self.api_concurrency = n;
        self
    }

    pub fn with_browser_concurrency(mut self, n: usize) -> Self {
        self.browser_concurrency = n;
        self
    }

    /// Defaults overlaid with `FORGELIST_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let d = &mut config.dispatcher;
        if let Some(ms) = parse::<u64>(&lookup, "FORGELIST_POLL_INTERVAL_MS")? {
            d.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, "FORGELIST_MAX_WORKERS")? {
            d.max_workers = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "FORGELIST_LEASE_TTL_MS")? {
            d.lease_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "FORGELIST_CALL_TIMEOUT_MS")? {
            d.call_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, "FORGELIST_MAX_ATTEMPTS")? {
            d.retry.max_attempts = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "FORGELIST_RETRY_BASE_MS")? {
            d.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(name) = lookup("FORGELIST_DISPATCHER_NAME") {
            d.name = name;
        }

        let r = &mut config.reconciler;
        if let Some(secs) = parse::<u64>(&lookup, "FORGELIST_RECONCILE_INTERVAL_SECS")? {
            r.interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64>(&lookup, "FORGELIST_SNAPSHOT_TIMEOUT_MS")? {
            r.snapshot_timeout = Duration::from_millis(ms);
        }
        if let Some(priority) = parse(&lookup, "FORGELIST_PLATFORM_PRIORITY")? {
            r.priority = priority;
        }
        if let Some(tolerance) = parse(&lookup, "FORGELIST_PRICE_TOLERANCE")? {
            r.heuristic.price_tolerance = tolerance;
        }

        if let Some(n) = parse(&lookup, "FORGELIST_API_CONCURRENCY")? {
            config.api_concurrency = n;
        }
        if let Some(n) = parse(&lookup, "FORGELIST_BROWSER_CONCURRENCY")? {
            config.browser_concurrency = n;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.dispatcher;
        if d.max_workers == 0 || d.batch_size == 0 {
            return Err(ConfigError::Inconsistent(
                "dispatcher needs at least one worker and a non-empty batch".into(),
            ));
        }
        if d.lease_ttl <= d.call_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "lease ttl {:?} must exceed call timeout {:?}",
                d.lease_ttl, d.call_timeout
            )));
        }
        if d.retry.max_attempts == 0 {
            return Err(ConfigError::Inconsistent("max_attempts must be at least 1".into()));
        }
        let tolerance = self.reconciler.heuristic.price_tolerance;
        if !(tolerance > 0.0 && tolerance < 1.0) {
            return Err(ConfigError::Inconsistent(format!(
                "price tolerance {tolerance} must be in (0, 1)"
            )));
        }
        if self.api_concurrency == 0 || self.browser_concurrency == 0 {
            return Err(ConfigError::Inconsistent("concurrency ceilings must be positive".into()));
        }
        Ok(())
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: err.to_string(),
            }),
    }
}
