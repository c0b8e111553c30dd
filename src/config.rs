//! Router configuration.
//!
//! Settings come from code (`RouterConfig::default()` plus field updates), a
//! JSON document, or `RULEFLOW_*` environment variables. Unset values keep
//! their defaults.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Maximum nesting of `route` calls (env: `RULEFLOW_MAX_ROUTE_DEPTH`).
pub const ENV_MAX_ROUTE_DEPTH: &str = "RULEFLOW_MAX_ROUTE_DEPTH";
/// Proc-event level (env: `RULEFLOW_PROCEVENTS_LEVEL`).
pub const ENV_PROCEVENTS_LEVEL: &str = "RULEFLOW_PROCEVENTS_LEVEL";
/// Per-subscriber proc-event buffer (env: `RULEFLOW_PROCEVENTS_CAPACITY`).
pub const ENV_PROCEVENTS_CAPACITY: &str = "RULEFLOW_PROCEVENTS_CAPACITY";
/// Proc events routed back as `rule-proc-event` (env: `RULEFLOW_PROCEVENTS_MATCHING`).
pub const ENV_PROCEVENTS_MATCHING: &str = "RULEFLOW_PROCEVENTS_MATCHING";
/// Default cache mode of new subjects (env: `RULEFLOW_USE_CACHE`).
pub const ENV_USE_CACHE: &str = "RULEFLOW_USE_CACHE";

/// How much detail rules publish about their execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcEventsLevel {
    /// Nothing is recorded.
    #[default]
    Disabled,
    /// One record per rule application, without payload diffs.
    Light,
    /// Like `Light`, plus a payload diff for every step.
    Full,
}

impl ProcEventsLevel {
    /// Whether records are built at all.
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl fmt::Display for ProcEventsLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Light => f.write_str("light"),
            Self::Full => f.write_str("full"),
        }
    }
}

impl FromStr for ProcEventsLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "disabled" | "off" => Ok(Self::Disabled),
            "1" | "light" => Ok(Self::Light),
            "2" | "full" => Ok(Self::Full),
            _ => Err(ConfigError::InvalidValue {
                key: ENV_PROCEVENTS_LEVEL.to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Event router configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Nested `route` calls allowed before failing with `RecursionLimit`.
    pub max_route_depth: usize,
    /// Proc-event detail.
    pub proc_events_level: ProcEventsLevel,
    /// Buffer per proc-event subscriber; events beyond it are dropped.
    pub proc_events_capacity: usize,
    /// Whether subjects built by the router use the write-back cache.
    pub use_cache_default: bool,
    /// `field=value` terms selecting proc events to route as
    /// `rule-proc-event`, see [`ProcEventRouting::matching`].
    ///
    /// [`ProcEventRouting::matching`]: crate::proc_event::ProcEventRouting::matching
    pub proc_events_matching: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_route_depth: 64,
            proc_events_level: ProcEventsLevel::Disabled,
            proc_events_capacity: 1024,
            use_cache_default: true,
            proc_events_matching: None,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl RouterConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read `RULEFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, which maps a variable name to its value.
    ///
    /// ```
    /// use ruleflow::config::{ProcEventsLevel, RouterConfig};
    ///
    /// let config = RouterConfig::from_lookup(|key| match key {
    ///     "RULEFLOW_PROCEVENTS_LEVEL" => Some("2".to_string()),
    ///     _ => None,
    /// })
    /// .unwrap();
    /// assert_eq!(config.proc_events_level, ProcEventsLevel::Full);
    /// assert_eq!(config.max_route_depth, 64);
    /// ```
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_MAX_ROUTE_DEPTH) {
            config.max_route_depth = parse_usize(ENV_MAX_ROUTE_DEPTH, &v)?;
        }
        if let Some(v) = lookup(ENV_PROCEVENTS_LEVEL) {
            config.proc_events_level = v.parse()?;
        }
        if let Some(v) = lookup(ENV_PROCEVENTS_CAPACITY) {
            config.proc_events_capacity = parse_usize(ENV_PROCEVENTS_CAPACITY, &v)?;
        }
        if let Some(v) = lookup(ENV_USE_CACHE) {
            config.use_cache_default = parse_bool(ENV_USE_CACHE, &v)?;
        }
        if let Some(v) = lookup(ENV_PROCEVENTS_MATCHING) {
            crate::proc_event::ProcEventRouting::matching(&v)?;
            config.proc_events_matching = Some(v);
        }
        Ok(config)
    }
}
