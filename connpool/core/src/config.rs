//! Pool Configuration
//!
//! Limits and timings for connection managers, loadable from a TOML file at
//! `$XDG_CONFIG_HOME/connpool/pool.toml` with environment overrides.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. Explicit [`ConfigOverrides`] applied by the caller
//! 2. Environment variables (`CONNPOOL_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [pool]
//! max_total = 20
//! default_max_per_route = 2
//! idle_timeout_ms = 30000
//! reap_interval_ms = 5000
//! acquire_timeout_ms = -1
//!
//! [[pool.route]]
//! host = "api.example.com"
//! port = 443
//! secure = true
//! max = 8
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::WaitPolicy;
use crate::route::Route;

/// Default global connection limit
pub const DEFAULT_MAX_TOTAL: usize = 20;

/// Default per-route connection limit
pub const DEFAULT_MAX_PER_ROUTE: usize = 2;

/// Default chunk buffer size for chunked request bodies
pub const DEFAULT_CHUNK_SIZE: usize = 2048;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where the effective configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Explicit overrides
    Overrides,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overrides => write!(f, "overrides"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Pool Configuration
// =============================================================================

/// Per-route limit override
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteLimit {
    /// Route the limit applies to
    #[serde(flatten)]
    pub route: Route,
    /// Maximum connections (leased + idle) for the route
    pub max: usize,
}

/// Limits and timings for a connection manager
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum connections across all routes
    pub max_total: usize,

    /// Maximum connections per route unless overridden
    pub default_max_per_route: usize,

    /// Per-route overrides
    #[serde(rename = "route", skip_serializing_if = "Vec::is_empty")]
    pub route_limits: Vec<RouteLimit>,

    /// Idle connections older than this are closed by the reaper (ms)
    pub idle_timeout_ms: u64,

    /// Interval between reaper sweeps (ms)
    pub reap_interval_ms: u64,

    /// Leases older than this are treated as abandoned (ms, 0 = never)
    pub lease_timeout_ms: u64,

    /// Acquisition timeout: negative waits forever, zero fails fast
    pub acquire_timeout_ms: i64,

    /// Transport connect timeout (ms)
    pub connect_timeout_ms: u64,

    /// Buffer capacity of chunked request bodies
    pub chunk_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: DEFAULT_MAX_TOTAL,
            default_max_per_route: DEFAULT_MAX_PER_ROUTE,
            route_limits: Vec::new(),
            idle_timeout_ms: 30_000,
            reap_interval_ms: 5_000,
            lease_timeout_ms: 0,
            acquire_timeout_ms: -1,
            connect_timeout_ms: 10_000,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the global connection limit
    #[must_use]
    pub fn with_max_total(mut self, max: usize) -> Self {
        self.max_total = max;
        self
    }

    /// Set the default per-route limit
    #[must_use]
    pub fn with_default_max_per_route(mut self, max: usize) -> Self {
        self.default_max_per_route = max;
        self
    }

    /// Override the limit for one route
    #[must_use]
    pub fn with_max_for_route(mut self, route: Route, max: usize) -> Self {
        self.route_limits.retain(|limit| limit.route != route);
        self.route_limits.push(RouteLimit { route, max });
        self
    }

    /// Set the idle timeout
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = duration_to_ms(timeout);
        self
    }

    /// Set the reaper sweep interval
    #[must_use]
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval_ms = duration_to_ms(interval);
        self
    }

    /// Set the abandoned-lease bound
    #[must_use]
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout_ms = duration_to_ms(timeout);
        self
    }

    /// Set the acquisition timeout in milliseconds (negative = forever)
    #[must_use]
    pub fn with_acquire_timeout_ms(mut self, ms: i64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Set the transport connect timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_to_ms(timeout);
        self
    }

    /// Set the chunk buffer size
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Effective limit for a route
    #[must_use]
    pub fn max_for(&self, route: &Route) -> usize {
        self.route_limits
            .iter()
            .find(|limit| &limit.route == route)
            .map_or(self.default_max_per_route, |limit| limit.max)
    }

    /// Per-route overrides as a lookup table
    #[must_use]
    pub fn route_limit_map(&self) -> HashMap<Route, usize> {
        self.route_limits
            .iter()
            .map(|limit| (limit.route.clone(), limit.max))
            .collect()
    }

    /// Idle timeout as a duration
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Reaper interval as a duration
    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Abandoned-lease bound, if enabled
    #[must_use]
    pub fn lease_timeout(&self) -> Option<Duration> {
        (self.lease_timeout_ms > 0).then(|| Duration::from_millis(self.lease_timeout_ms))
    }

    /// Connect timeout as a duration
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Acquisition wait policy
    #[must_use]
    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy::from_millis(self.acquire_timeout_ms)
    }

    /// Check that every limit is usable
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_total == 0 {
            return Err(ConfigError::ValidationError(
                "max_total must be at least 1".to_string(),
            ));
        }
        if self.default_max_per_route == 0 {
            return Err(ConfigError::ValidationError(
                "default_max_per_route must be at least 1".to_string(),
            ));
        }
        if let Some(limit) = self.route_limits.iter().find(|limit| limit.max == 0) {
            return Err(ConfigError::ValidationError(format!(
                "limit for {} must be at least 1",
                limit.route
            )));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// Loading
// =============================================================================

/// Top-level layout of the TOML file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolToml {
    /// `[pool]` section
    pub pool: PoolConfig,
}

/// Configuration together with where it came from
#[derive(Clone, Debug)]
pub struct LoadedConfig {
    /// Effective pool configuration
    pub pool: PoolConfig,
    /// Highest-priority source that contributed a value
    pub source: ConfigSource,
    /// File that was read, if any
    pub path: Option<PathBuf>,
}

/// Default config file location
///
/// `$XDG_CONFIG_HOME/connpool/pool.toml`, typically
/// `~/.config/connpool/pool.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("connpool").join("pool.toml"))
}

/// Load configuration from the default path and the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read, parsed or
/// validated. A missing file is not an error.
pub fn load_config() -> Result<LoadedConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the
/// resulting configuration fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<LoadedConfig, ConfigError> {
    load_config_with_overrides(path, &ConfigOverrides::new())
}

/// Load configuration from a path and the environment, then apply `overrides`
///
/// Non-empty overrides take precedence over both the environment and the
/// file, and the reported source becomes [`ConfigSource::Overrides`].
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the
/// resulting configuration fails validation.
pub fn load_config_with_overrides(
    path: Option<PathBuf>,
    overrides: &ConfigOverrides,
) -> Result<LoadedConfig, ConfigError> {
    let mut loaded = LoadedConfig {
        pool: PoolConfig::default(),
        source: ConfigSource::Default,
        path: None,
    };

    if let Some(config_path) = path {
        if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;
            let file: PoolToml = toml::from_str(&content)?;
            loaded.pool = file.pool;
            loaded.source = ConfigSource::File;
            tracing::info!(path = %config_path.display(), "Loaded pool configuration from file");
            loaded.path = Some(config_path);
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    let env = ConfigOverrides::from_env();
    if !env.is_empty() {
        env.apply(&mut loaded.pool);
        loaded.source = ConfigSource::Env;
    }

    if !overrides.is_empty() {
        overrides.apply(&mut loaded.pool);
        loaded.source = ConfigSource::Overrides;
        tracing::debug!(?overrides, "Applied explicit configuration overrides");
    }

    loaded.pool.validate()?;
    Ok(loaded)
}

/// Explicit overrides, applied on top of file and defaults
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// Global limit override
    pub max_total: Option<usize>,
    /// Default per-route limit override
    pub default_max_per_route: Option<usize>,
    /// Idle timeout override (ms)
    pub idle_timeout_ms: Option<u64>,
    /// Acquisition timeout override (ms)
    pub acquire_timeout_ms: Option<i64>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `CONNPOOL_*` environment variables
    ///
    /// Unparsable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build overrides from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            max_total: lookup("CONNPOOL_MAX_TOTAL").and_then(|v| v.trim().parse().ok()),
            default_max_per_route: lookup("CONNPOOL_MAX_PER_ROUTE")
                .and_then(|v| v.trim().parse().ok()),
            idle_timeout_ms: lookup("CONNPOOL_IDLE_TIMEOUT_MS").and_then(|v| v.trim().parse().ok()),
            acquire_timeout_ms: lookup("CONNPOOL_ACQUIRE_TIMEOUT_MS")
                .and_then(|v| v.trim().parse().ok()),
        }
    }

    /// Set the global limit override
    #[must_use]
    pub fn with_max_total(mut self, max: usize) -> Self {
        self.max_total = Some(max);
        self
    }

    /// Set the default per-route limit override
    #[must_use]
    pub fn with_default_max_per_route(mut self, max: usize) -> Self {
        self.default_max_per_route = Some(max);
        self
    }

    /// Set the idle timeout override
    #[must_use]
    pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = Some(ms);
        self
    }

    /// Set the acquisition timeout override
    #[must_use]
    pub fn with_acquire_timeout_ms(mut self, ms: i64) -> Self {
        self.acquire_timeout_ms = Some(ms);
        self
    }

    /// Whether no override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the overrides to a configuration
    pub fn apply(&self, config: &mut PoolConfig) {
        if let Some(max) = self.max_total {
            config.max_total = max;
        }
        if let Some(max) = self.default_max_per_route {
            config.default_max_per_route = max;
        }
        if let Some(ms) = self.idle_timeout_ms {
            config.idle_timeout_ms = ms;
        }
        if let Some(ms) = self.acquire_timeout_ms {
            config.acquire_timeout_ms = ms;
        }
    }
}
