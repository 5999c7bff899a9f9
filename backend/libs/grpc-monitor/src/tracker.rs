//! Error tracking sink
//!
//! Failures recorded by the emitter are forwarded to an [`ErrorTracker`].
//! The production tracker pushes events to a DSN-addressed ingestion
//! endpoint from a background task. `capture` only enqueues into a bounded
//! channel, so the call path never waits on the network.

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tonic::Status;
use url::Url;
use uuid::Uuid;

const CLIENT_NAME: &str = concat!("grpc-monitor/", env!("CARGO_PKG_VERSION"));

/// A single error report
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: &'static str,
    pub platform: &'static str,
    pub logger: &'static str,
    pub message: String,
    pub tags: BTreeMap<String, String>,
}

impl ErrorEvent {
    /// Build an event for a failure on `endpoint`
    ///
    /// A `tonic::Status` contributes only its message and code; its
    /// metadata never leaves the process.
    pub fn new(endpoint: &str, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("endpoint".to_string(), endpoint.to_string());

        let message = match error.downcast_ref::<Status>() {
            Some(status) => {
                tags.insert("grpc_code".to_string(), format!("{:?}", status.code()));
                status.message().to_string()
            }
            None => error.to_string(),
        };

        Self {
            event_id: Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            level: "error",
            platform: "other",
            logger: "grpc-monitor",
            message,
            tags,
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.tags.get("endpoint").map(String::as_str)
    }

    pub fn grpc_code(&self) -> Option<&str> {
        self.tags.get("grpc_code").map(String::as_str)
    }
}

/// Destination for error reports
///
/// Implementations must not block; they are called on the request path.
#[cfg_attr(test, mockall::automock)]
pub trait ErrorTracker: Send + Sync {
    fn capture(&self, event: ErrorEvent);
}

/// Tracker used when no DSN is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl ErrorTracker for NoopTracker {
    fn capture(&self, event: ErrorEvent) {
        tracing::debug!(
            event_id = %event.event_id,
            message = %event.message,
            "error tracking disabled, dropping event"
        );
    }
}

/// Parsed error tracker DSN
///
/// Format: `{scheme}://{public_key}[:{secret_key}]@{host}[:{port}][/{path}]/{project_id}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    scheme: String,
    public_key: String,
    secret_key: Option<String>,
    host: String,
    port: Option<u16>,
    path: String,
    project_id: String,
}

impl Dsn {
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Ingestion endpoint for events
    pub fn store_url(&self) -> String {
        let port = self.port.map(|p| format!(":{}", p)).unwrap_or_default();
        format!(
            "{}://{}{}{}/api/{}/store/",
            self.scheme, self.host, port, self.path, self.project_id
        )
    }

    /// Value of the `X-Sentry-Auth` header
    pub fn auth_header(&self) -> String {
        let mut header = format!(
            "Sentry sentry_version=7, sentry_client={}, sentry_key={}",
            CLIENT_NAME, self.public_key
        );
        if let Some(secret) = &self.secret_key {
            header.push_str(", sentry_secret=");
            header.push_str(secret);
        }
        header
    }
}

impl FromStr for Dsn {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self> {
        let url = Url::parse(s).map_err(|e| MonitorError::invalid_dsn(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "https" => url.scheme().to_string(),
            other => {
                return Err(MonitorError::invalid_dsn(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };

        let public_key = url.username().to_string();
        if public_key.is_empty() {
            return Err(MonitorError::invalid_dsn("missing public key"));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| MonitorError::invalid_dsn("missing host"))?
            .to_string();

        let mut segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        let project_id = segments
            .pop()
            .ok_or_else(|| MonitorError::invalid_dsn("missing project id"))?
            .to_string();
        let path = segments.iter().map(|seg| format!("/{}", seg)).collect();

        Ok(Self {
            scheme,
            public_key,
            secret_key: url.password().map(str::to_string),
            host,
            port: url.port(),
            path,
            project_id,
        })
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = self.port.map(|p| format!(":{}", p)).unwrap_or_default();
        write!(
            f,
            "{}://{}@{}{}{}/{}",
            self.scheme, self.public_key, self.host, port, self.path, self.project_id
        )
    }
}

/// Push client delivering events to a DSN endpoint
///
/// Events go through a bounded queue to a background task. When the queue
/// is full new events are dropped and counted.
pub struct DsnTracker {
    dsn: Dsn,
    sender: mpsc::Sender<ErrorEvent>,
    dropped: Arc<AtomicU64>,
}

impl DsnTracker {
    /// Start the delivery task on the current tokio runtime
    pub fn spawn(dsn: Dsn, queue_capacity: usize, timeout: Duration) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| MonitorError::Runtime(e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(CLIENT_NAME)
            .build()
            .map_err(|e| MonitorError::invalid_config(format!("tracker client: {}", e)))?;

        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        handle.spawn(deliver_events(
            client,
            dsn.store_url(),
            dsn.auth_header(),
            receiver,
        ));

        tracing::info!(dsn = %dsn, "Error tracker started");

        Ok(Self {
            dsn,
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn dsn(&self) -> &Dsn {
        &self.dsn
    }

    /// Events dropped because the queue was full or closed
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ErrorTracker for DsnTracker {
    fn capture(&self, event: ErrorEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    event_id = %event.event_id,
                    "error tracker queue full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    event_id = %event.event_id,
                    "error tracker stopped, dropping event"
                );
            }
        }
    }
}

async fn deliver_events(
    client: reqwest::Client,
    store_url: String,
    auth_header: String,
    mut receiver: mpsc::Receiver<ErrorEvent>,
) {
    while let Some(event) = receiver.recv().await {
        let result = client
            .post(&store_url)
            .header("X-Sentry-Auth", &auth_header)
            .json(&event)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());

        if let Err(e) = result {
            tracing::warn!(
                event_id = %event.event_id,
                error = %e,
                "failed to deliver error event"
            );
        }
    }
    tracing::debug!("error tracker delivery task stopped");
}

/// Build the tracker described by `config`
///
/// An empty DSN yields a [`NoopTracker`]; a malformed one is an error.
pub fn tracker_from_config(config: &MonitorConfig) -> Result<Arc<dyn ErrorTracker>> {
    let dsn = config.tracker_dsn.trim();
    if dsn.is_empty() {
        tracing::info!("No error tracker DSN configured, error tracking disabled");
        return Ok(Arc::new(NoopTracker));
    }

    let dsn: Dsn = dsn.parse()?;
    let tracker = DsnTracker::spawn(
        dsn,
        config.tracker_queue_capacity,
        Duration::from_millis(config.tracker_timeout_ms),
    )?;
    Ok(Arc::new(tracker))
}
