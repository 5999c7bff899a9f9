//! Prometheus metrics for observed calls
//!
//! Tracks request count, error count and latency per endpoint. Every
//! metric carries the constant labels `method="rpc"` and
//! `process="<process id>"`.

use crate::error::Result;
use crate::fault;
use crate::tracker::{ErrorEvent, ErrorTracker};
use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Sink for call outcomes
///
/// Exactly one of the two methods is invoked per observed call.
/// Implementations must never panic out of `record_failure` for a broken
/// error tracker.
pub trait Emitter: Send + Sync {
    /// Record a successful call and its latency
    fn record_success(&self, endpoint: &str, latency_ms: f64);

    /// Record a failed call and forward the error for tracking
    fn record_failure(&self, endpoint: &str, error: &(dyn std::error::Error + 'static));
}

/// Call metrics backed by Prometheus aggregates
#[derive(Clone)]
pub struct MonitorMetrics {
    /// Total successful requests
    /// Labels: endpoint
    requests_total: IntCounterVec,

    /// Total failed requests
    /// Labels: endpoint
    errors_total: IntCounterVec,

    /// Response latency in milliseconds (histogram)
    /// Labels: endpoint
    response_latency: HistogramVec,

    tracker: Arc<dyn ErrorTracker>,
}

impl MonitorMetrics {
    /// Create the aggregates under the `application` namespace
    pub fn new(
        application: &str,
        process: u16,
        tracker: Arc<dyn ErrorTracker>,
        buckets: &[f64],
    ) -> Result<Self> {
        let const_labels: HashMap<String, String> = [
            ("method".to_string(), "rpc".to_string()),
            ("process".to_string(), process.to_string()),
        ]
        .into_iter()
        .collect();

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Total request counts")
                .namespace(application)
                .const_labels(const_labels.clone()),
            &["endpoint"],
        )?;

        let errors_total = IntCounterVec::new(
            Opts::new("error_total", "Total error counts")
                .namespace(application)
                .const_labels(const_labels.clone()),
            &["endpoint"],
        )?;

        let latency_opts = HistogramOpts::new(
            "response_latency_millisecond",
            "Response latency (millisecond)",
        )
        .namespace(application)
        .const_labels(const_labels)
        .buckets(buckets.to_vec());

        // HistogramVec defers bucket checks to the first child series
        Histogram::with_opts(latency_opts.clone())?;
        let response_latency = HistogramVec::new(latency_opts, &["endpoint"])?;

        Ok(Self {
            requests_total,
            errors_total,
            response_latency,
            tracker,
        })
    }

    /// Register all aggregates with `registry`
    ///
    /// On a collision nothing stays registered.
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.requests_total.clone()))?;

        if let Err(e) = registry.register(Box::new(self.errors_total.clone())) {
            let _ = registry.unregister(Box::new(self.requests_total.clone()));
            return Err(e.into());
        }

        if let Err(e) = registry.register(Box::new(self.response_latency.clone())) {
            let _ = registry.unregister(Box::new(self.requests_total.clone()));
            let _ = registry.unregister(Box::new(self.errors_total.clone()));
            return Err(e.into());
        }

        Ok(())
    }

    pub fn request_count(&self, endpoint: &str) -> u64 {
        self.requests_total.with_label_values(&[endpoint]).get()
    }

    pub fn error_count(&self, endpoint: &str) -> u64 {
        self.errors_total.with_label_values(&[endpoint]).get()
    }

    pub fn latency_histogram(&self, endpoint: &str) -> prometheus::Histogram {
        self.response_latency.with_label_values(&[endpoint])
    }
}

impl Emitter for MonitorMetrics {
    fn record_success(&self, endpoint: &str, latency_ms: f64) {
        self.requests_total.with_label_values(&[endpoint]).inc();
        self.response_latency
            .with_label_values(&[endpoint])
            .observe(latency_ms);
    }

    fn record_failure(&self, endpoint: &str, error: &(dyn std::error::Error + 'static)) {
        self.errors_total.with_label_values(&[endpoint]).inc();

        let event = ErrorEvent::new(endpoint, error);
        let tracker = &self.tracker;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| tracker.capture(event))) {
            let stack = fault::take_panic_stack().unwrap_or_default();
            tracing::error!(
                endpoint = %endpoint,
                panic = %fault::payload_text(payload.as_ref()),
                stack = %stack,
                "error tracker panicked while reporting failure"
            );
        }
    }
}
