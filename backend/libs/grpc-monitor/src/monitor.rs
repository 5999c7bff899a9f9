//! Monitor facade
//!
//! Builds the emitter from a [`MonitorConfig`] once per process and hands
//! the same emitter to every layer, helper and span reporter.

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::interceptor;
use crate::layer::{observed_call_layer, MonitoringLayer, ObservedCallLayer, RecoveryLayer};
use crate::metrics::{Emitter, MonitorMetrics};
use crate::server;
use crate::span::SpanReporter;
use crate::tracker::tracker_from_config;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometheus::Registry;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tonic::Status;

/// (application, process) pairs registered in the default registry
static REGISTERED: Lazy<Mutex<HashSet<(String, u16)>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Entry point tying the emitter, layers and metrics endpoint together
#[derive(Clone)]
pub struct Monitor {
    emitter: Arc<dyn Emitter>,
    metrics: Option<MonitorMetrics>,
    registry: Registry,
}

impl Monitor {
    /// Build a monitor registered in the process-wide default registry
    ///
    /// Fails with [`MonitorError::AlreadyRegistered`] when called twice for
    /// the same application and process.
    pub fn new(config: &MonitorConfig) -> Result<Self> {
        config.check()?;

        let key = (config.application.clone(), config.process);
        let mut registered = REGISTERED.lock();
        if registered.contains(&key) {
            return Err(MonitorError::AlreadyRegistered {
                application: key.0,
                process: key.1,
            });
        }

        let monitor = Self::build(config, prometheus::default_registry().clone())?;
        registered.insert(key);
        Ok(monitor)
    }

    /// Build a monitor registered in `registry`
    ///
    /// Name collisions inside `registry` surface as [`MonitorError::Metrics`].
    pub fn with_registry(config: &MonitorConfig, registry: Registry) -> Result<Self> {
        config.check()?;
        Self::build(config, registry)
    }

    /// Wrap an arbitrary emitter; no metrics are registered
    pub fn with_emitter(emitter: Arc<dyn Emitter>) -> Self {
        Self {
            emitter,
            metrics: None,
            registry: Registry::new(),
        }
    }

    fn build(config: &MonitorConfig, registry: Registry) -> Result<Self> {
        let tracker = tracker_from_config(config)?;
        let metrics = MonitorMetrics::new(
            &config.application,
            config.process,
            tracker,
            &config.buckets,
        )?;
        metrics.register(&registry)?;

        tracing::info!(
            application = %config.application,
            process = config.process,
            "Monitor initialized"
        );

        Ok(Self {
            emitter: Arc::new(metrics.clone()),
            metrics: Some(metrics),
            registry,
        })
    }

    pub fn emitter(&self) -> Arc<dyn Emitter> {
        self.emitter.clone()
    }

    /// Prometheus metrics, when built from a configuration
    pub fn metrics(&self) -> Option<&MonitorMetrics> {
        self.metrics.as_ref()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn monitoring_layer(&self) -> MonitoringLayer {
        MonitoringLayer::new(self.emitter.clone())
    }

    pub fn recovery_layer(&self) -> RecoveryLayer {
        RecoveryLayer::new(self.emitter.clone())
    }

    /// Full stack for `Server::builder().layer(..)`
    pub fn layer(&self) -> ObservedCallLayer {
        observed_call_layer(self.emitter.clone())
    }

    pub fn span_reporter(&self) -> SpanReporter {
        SpanReporter::new(self.emitter.clone())
    }

    /// Spawn the `/metrics` endpoint for this monitor's registry
    ///
    /// Fails with [`MonitorError::Runtime`] outside a tokio runtime.
    pub fn start_metrics_server(&self, port: u16) -> Result<JoinHandle<()>> {
        server::start_metrics_server(port, self.registry.clone())
    }

    pub async fn monitoring<F, T, E>(&self, endpoint: &str, handler: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: std::error::Error + 'static,
    {
        interceptor::monitoring(self.emitter.as_ref(), endpoint, handler).await
    }

    pub async fn recovery<F, T>(&self, endpoint: &str, handler: F) -> std::result::Result<T, Status>
    where
        F: Future<Output = std::result::Result<T, Status>>,
    {
        interceptor::recovery(self.emitter.as_ref(), endpoint, handler).await
    }

    /// Observe `handler` with both stages
    pub async fn observe<F, T>(&self, endpoint: &str, handler: F) -> std::result::Result<T, Status>
    where
        F: Future<Output = std::result::Result<T, Status>>,
    {
        interceptor::observe(self.emitter.as_ref(), endpoint, handler).await
    }
}
