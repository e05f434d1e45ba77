//! Configuration for dispatch, resilience and connector health
//!
//! Every struct deserializes with defaults so partial TOML files work.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::error::Result;

/// RobotCopy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotCopyConfig {
    /// Default backend
    pub primary_backend_url: String,

    /// Backend chosen when the selector toggle is enabled
    pub secondary_backend_url: String,

    /// Toggle that routes to the secondary backend; unset means always primary
    pub backend_selector_toggle: Option<String>,

    /// Path prefix for `send_message`
    pub api_base_path: String,

    /// Record sends and responses in the message history
    pub enable_tracing: bool,

    /// Allow vendor trace headers (still gated by the `enable-datadog` toggle)
    pub enable_datadog: bool,

    /// Seed values for the built-in toggle source
    pub initial_toggles: HashMap<String, bool>,

    /// Retry configuration
    pub retry_policy: RetryConfig,

    /// Circuit breaker, disabled when unset
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Throttle, disabled when unset
    pub throttle: Option<ThrottleConfig>,
}

impl Default for RobotCopyConfig {
    fn default() -> Self {
        Self {
            primary_backend_url: "http://localhost:3001".to_string(),
            secondary_backend_url: "http://localhost:8080".to_string(),
            backend_selector_toggle: None,
            api_base_path: "/api".to_string(),
            enable_tracing: true,
            enable_datadog: true,
            initial_toggles: HashMap::new(),
            retry_policy: RetryConfig::default(),
            circuit_breaker: None,
            throttle: None,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: usize,

    /// Delay before the first retry
    pub initial_delay_ms: u64,

    /// Upper bound on any single delay
    pub max_delay_ms: u64,

    /// Exponential backoff multiplier
    pub multiplier: f64,

    /// Scale each delay by a uniform factor in [0.5, 1.0]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Name used for monitor dimensions and errors
    pub name: String,

    /// Failures (or monitor error count) that open the breaker
    pub threshold: u32,

    /// Time spent open before a probe is allowed
    pub reset_ms: u64,

    /// Read failures from the attached monitor instead of an internal counter
    pub use_monitor_for_threshold: bool,

    /// Monitor error rate that opens the breaker; defaults to `threshold / 10`
    pub error_rate_threshold: Option<f64>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "robot-copy".to_string(),
            threshold: 5,
            reset_ms: 30_000,
            use_monitor_for_threshold: false,
            error_rate_threshold: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_ms)
    }

    pub fn effective_error_rate(&self) -> f64 {
        self.error_rate_threshold
            .unwrap_or(self.threshold as f64 / 10.0)
    }
}

/// Sliding-window throttle configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    pub window_ms: u64,
    pub max_requests_per_minute: Option<u64>,
    pub max_bytes_per_minute: Option<u64>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests_per_minute: None,
            max_bytes_per_minute: None,
        }
    }
}

/// Resource monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub window_ms: u64,
    pub max_samples: usize,
    /// Static tags echoed in every snapshot
    pub dimensions: BTreeMap<String, String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_samples: 1_000,
            dimensions: BTreeMap::new(),
        }
    }
}

/// Periodic connection health check configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval_ms: u64,
    /// Idle time after which a live connection counts as degraded
    pub stale_after_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            stale_after_ms: 60_000,
        }
    }
}

/// Limits used by topology validation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationThresholds {
    /// More outgoing connections than this is a warning
    pub max_fan_out: usize,
    /// More repeats of one event mapping than this is a warning
    pub max_mapping_repeats: usize,
    /// Connections older than this with recent activity are high frequency
    pub high_frequency_min_age_ms: u64,
    pub high_frequency_max_idle_ms: u64,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            max_fan_out: 10,
            max_mapping_repeats: 5,
            high_frequency_min_age_ms: 60_000,
            high_frequency_max_idle_ms: 1_000,
        }
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: RobotCopyConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RobotCopyConfig::default(),
        }
    }

    pub fn primary_backend(mut self, url: impl Into<String>) -> Self {
        self.config.primary_backend_url = url.into();
        self
    }

    pub fn secondary_backend(mut self, url: impl Into<String>) -> Self {
        self.config.secondary_backend_url = url.into();
        self
    }

    pub fn backend_selector_toggle(mut self, toggle: impl Into<String>) -> Self {
        self.config.backend_selector_toggle = Some(toggle.into());
        self
    }

    pub fn api_base_path(mut self, path: impl Into<String>) -> Self {
        self.config.api_base_path = path.into();
        self
    }

    pub fn tracing(mut self, enabled: bool) -> Self {
        self.config.enable_tracing = enabled;
        self
    }

    pub fn datadog(mut self, enabled: bool) -> Self {
        self.config.enable_datadog = enabled;
        self
    }

    pub fn toggle(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.config.initial_toggles.insert(name.into(), enabled);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry_policy = retry;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.config.retry_policy.max_retries = retries;
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = Some(breaker);
        self
    }

    pub fn throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.config.throttle = Some(throttle);
        self
    }

    pub fn build(self) -> RobotCopyConfig {
        self.config
    }
}

/// Load configuration from environment variables
pub fn from_env() -> RobotCopyConfig {
    let mut config = RobotCopyConfig::default();

    if let Ok(url) = std::env::var("TOME_LINK_PRIMARY_URL") {
        config.primary_backend_url = url;
    }

    if let Ok(url) = std::env::var("TOME_LINK_SECONDARY_URL") {
        config.secondary_backend_url = url;
    }

    if let Ok(toggle) = std::env::var("TOME_LINK_BACKEND_TOGGLE") {
        if !toggle.is_empty() {
            config.backend_selector_toggle = Some(toggle);
        }
    }

    if let Ok(path) = std::env::var("TOME_LINK_API_BASE_PATH") {
        config.api_base_path = path;
    }

    if let Ok(retries) = std::env::var("TOME_LINK_MAX_RETRIES") {
        if let Ok(n) = retries.parse::<usize>() {
            config.retry_policy.max_retries = n;
        }
    }

    if let Ok(tracing) = std::env::var("TOME_LINK_TRACING") {
        config.enable_tracing = tracing.to_lowercase() == "true" || tracing == "1";
    }

    config
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<RobotCopyConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: RobotCopyConfig = toml::from_str(&contents)?;
    Ok(config)
}
