//! Monitor configuration
//!
//! Loaded from `MONITOR_*` environment variables or built in code:
//!
//! | Variable                          | Field                    | Default        |
//! |-----------------------------------|--------------------------|----------------|
//! | `MONITOR_APPLICATION`             | `application`            | required       |
//! | `MONITOR_PROCESS`                 | `process`                | required       |
//! | `MONITOR_TRACKER_DSN`             | `tracker_dsn`            | `""` (off)     |
//! | `MONITOR_BUCKETS`                 | `buckets`                | 10,20,...,3000 |
//! | `MONITOR_METRICS_PORT`            | `metrics_port`           | 9090           |
//! | `MONITOR_TRACKER_QUEUE_CAPACITY`  | `tracker_queue_capacity` | 1024           |
//! | `MONITOR_TRACKER_TIMEOUT_MS`      | `tracker_timeout_ms`     | 3000           |

use crate::error::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Default latency histogram buckets in milliseconds
pub const DEFAULT_BUCKETS: [f64; 12] = [
    10.0, 20.0, 30.0, 50.0, 80.0, 100.0, 200.0, 300.0, 500.0, 1000.0, 2000.0, 3000.0,
];

/// Monitor configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct MonitorConfig {
    /// Application name, used as the metrics namespace
    #[validate(custom(function = "validate_namespace"))]
    pub application: String,

    /// Process identifier (typically the gRPC listening port)
    pub process: u16,

    /// Error tracker DSN; empty disables error tracking
    #[serde(default)]
    pub tracker_dsn: String,

    /// Latency histogram buckets (milliseconds, strictly ascending)
    #[serde(default = "default_buckets")]
    #[validate(custom(function = "validate_buckets"))]
    pub buckets: Vec<f64>,

    /// Port of the `/metrics` exposition endpoint
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Pending error events kept before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    #[validate(range(min = 1, max = 65536))]
    pub tracker_queue_capacity: usize,

    /// HTTP timeout for a single error event delivery
    #[serde(default = "default_tracker_timeout_ms")]
    #[validate(range(min = 1, max = 60000))]
    pub tracker_timeout_ms: u64,
}

fn default_buckets() -> Vec<f64> {
    DEFAULT_BUCKETS.to_vec()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_tracker_timeout_ms() -> u64 {
    3000
}

fn validate_namespace(name: &str) -> std::result::Result<(), ValidationError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_head && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_metric_namespace"))
    }
}

fn validate_buckets(buckets: &[f64]) -> std::result::Result<(), ValidationError> {
    if buckets.is_empty() {
        return Err(ValidationError::new("empty_buckets"));
    }
    if buckets.iter().any(|b| !b.is_finite()) {
        return Err(ValidationError::new("non_finite_bucket"));
    }
    if buckets.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(ValidationError::new("buckets_not_ascending"));
    }
    Ok(())
}

impl MonitorConfig {
    /// Create a configuration with defaults for everything but the identity
    pub fn new(application: impl Into<String>, process: u16) -> Self {
        Self {
            application: application.into(),
            process,
            tracker_dsn: String::new(),
            buckets: default_buckets(),
            metrics_port: default_metrics_port(),
            tracker_queue_capacity: default_queue_capacity(),
            tracker_timeout_ms: default_tracker_timeout_ms(),
        }
    }

    /// Load from `MONITOR_*` environment variables and validate
    pub fn from_env() -> Result<Self> {
        let config: MonitorConfig = envy::prefixed("MONITOR_")
            .from_env()
            .map_err(|e| MonitorError::invalid_config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Validate, mapping failures into [`MonitorError::InvalidConfig`]
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| MonitorError::invalid_config(e.to_string()))
    }

    pub fn with_tracker_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.tracker_dsn = dsn.into();
        self
    }

    pub fn with_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn with_metrics_port(mut self, port: u16) -> Self {
        self.metrics_port = port;
        self
    }

    pub fn with_tracker_queue_capacity(mut self, capacity: usize) -> Self {
        self.tracker_queue_capacity = capacity;
        self
    }
}
