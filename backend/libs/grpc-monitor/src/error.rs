//! Error types for monitor setup and instrumented spans

use thiserror::Error;

/// Boxed error handed to the error tracker
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for monitor setup operations
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors that can occur while setting up the monitor
///
/// None of these are produced on the call path: once a [`crate::Monitor`]
/// exists, recording never fails.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Error-tracking DSN could not be parsed
    #[error("Invalid error tracker DSN: {0}")]
    InvalidDsn(String),

    /// Configuration failed validation or could not be loaded
    #[error("Invalid monitor configuration: {0}")]
    InvalidConfig(String),

    /// Metric construction or registry failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Metrics for this (application, process) pair are already registered
    #[error("Metrics already registered for application '{application}' process {process}")]
    AlreadyRegistered { application: String, process: u16 },

    /// The error tracker needs a running tokio runtime
    #[error("No tokio runtime available: {0}")]
    Runtime(String),

    /// Listener or socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    /// Create an invalid DSN error
    pub fn invalid_dsn(msg: impl Into<String>) -> Self {
        Self::InvalidDsn(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Outcome error of a standalone instrumented span
#[derive(Debug, Error)]
pub enum SpanError<E> {
    /// The span returned an ordinary error
    #[error("{0}")]
    Failed(E),

    /// The span (or its reporting) panicked; carries the panic text
    #[error("recover fail, panic error: {0}")]
    Panicked(String),
}

impl<E> SpanError<E> {
    /// Whether the span ended in a panic
    pub fn is_panic(&self) -> bool {
        matches!(self, SpanError::Panicked(_))
    }
}
