//! Engine configuration using Figment
//!
//! Configuration is layered:
//! 1. Built-in defaults (see [`scan_core::limits`])
//! 2. A TOML file (usually `config/scan_engine.toml`)
//! 3. Environment variables prefixed with `SCAN_ENGINE_`, with `__` separating
//!    nested keys
//!
//! Durations are written in humantime notation (`25ms`, `1s`).
//!
//! # Example
//! ```no_run
//! use scan_engine::config::EngineConfig;
//!
//! // SCAN_ENGINE_ADAPTIVE__RETRY_BUDGET=5 overrides the file
//! let config = EngineConfig::load_from("config/scan_engine.toml")?;
//! config.validate()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use scan_core::limits::{
    DEFAULT_CONTINUOUS_TIMEDELTA, DEFAULT_COUNT_LOOP_DELAY, DEFAULT_POLL_BACKOFF,
    DEFAULT_RETRY_BUDGET, DEFAULT_SPEED_DIVISOR, MAX_POINTS,
};
use scan_core::{ScanError, ScanResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::environment::EnvironmentSampling;
use crate::logging::OutputFormat;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "SCAN_ENGINE_";

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Delay between detector completion polls
    #[serde(default = "default_count_loop_delay", with = "humantime_serde")]
    pub count_loop_delay: Duration,
    /// Environment sampling
    #[serde(default)]
    pub environment: EnvironmentConfig,
    /// Adaptive scans
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    /// Continuous scans
    #[serde(default)]
    pub continuous: ContinuousConfig,
    /// Plan size limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How environment devices are sampled per point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// `single` (one reading per point) or `statistics` (average over the count)
    #[serde(default)]
    pub sampling: EnvironmentSampling,
}

/// Adaptive scan settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Infeasible positions tolerated in a row before the run terminates
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Sleep while the decision service has no position ready
    #[serde(default = "default_poll_backoff", with = "humantime_serde")]
    pub poll_backoff: Duration,
}

/// Continuous scan settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousConfig {
    /// Interval between two recorded points
    #[serde(default = "default_timedelta", with = "humantime_serde")]
    pub timedelta: Duration,
    /// Scan speed is the device speed divided by this, unless given explicitly
    #[serde(default = "default_speed_divisor")]
    pub speed_divisor: f64,
}

/// Plan size limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of points a plan may generate
    #[serde(default = "default_max_points")]
    pub max_points: usize,
}

/// Logging settings consumed by [`crate::logging::init`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
    /// Log span open/close events
    #[serde(default)]
    pub span_events: bool,
    /// ANSI colors for the pretty format
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

// Default value functions
fn default_count_loop_delay() -> Duration {
    DEFAULT_COUNT_LOOP_DELAY
}

fn default_retry_budget() -> u32 {
    DEFAULT_RETRY_BUDGET
}

fn default_poll_backoff() -> Duration {
    DEFAULT_POLL_BACKOFF
}

fn default_timedelta() -> Duration {
    DEFAULT_CONTINUOUS_TIMEDELTA
}

fn default_speed_divisor() -> f64 {
    DEFAULT_SPEED_DIVISOR
}

fn default_max_points() -> usize {
    MAX_POINTS
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ansi() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            count_loop_delay: default_count_loop_delay(),
            environment: EnvironmentConfig::default(),
            adaptive: AdaptiveConfig::default(),
            continuous: ContinuousConfig::default(),
            limits: LimitsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            poll_backoff: default_poll_backoff(),
        }
    }
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        Self {
            timedelta: default_timedelta(),
            speed_divisor: default_speed_divisor(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_points: default_max_points(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: OutputFormat::default(),
            span_events: false,
            ansi: default_ansi(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `SCAN_ENGINE_*` environment variables only.
    pub fn from_env() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Load configuration from a TOML file and environment variables.
    ///
    /// A missing file is not an error; the defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> ScanResult<()> {
        if self.adaptive.retry_budget == 0 {
            return Err(ScanError::Config(
                "adaptive.retry_budget must be at least 1".to_string(),
            ));
        }
        let divisor = self.continuous.speed_divisor;
        if divisor.is_nan() || divisor <= 0.0 {
            return Err(ScanError::Config(format!(
                "continuous.speed_divisor must be positive, got {}",
                self.continuous.speed_divisor
            )));
        }
        if self.continuous.timedelta.is_zero() {
            return Err(ScanError::Config(
                "continuous.timedelta must not be zero".to_string(),
            ));
        }
        if self.limits.max_points == 0 {
            return Err(ScanError::Config(
                "limits.max_points must be at least 1".to_string(),
            ));
        }
        crate::logging::parse_log_level(&self.logging.level).map_err(ScanError::Config)?;
        Ok(())
    }
}
