//! gRPC Monitor - Observed-Call Middleware for tonic Servers
//!
//! Wraps every unary call with two stages:
//! - **Recovery** (outermost): a panic anywhere in the handler is caught,
//!   logged with its stack, recorded as a failure and answered with an
//!   `Internal` status instead of tearing down the connection
//! - **Monitoring**: request count, error count and latency histogram per
//!   endpoint; errors are also forwarded to an error tracker
//!
//! Usage:
//! ```ignore
//! use grpc_monitor::{Monitor, MonitorConfig};
//!
//! let config = MonitorConfig::from_env()?;
//! let monitor = Monitor::new(&config)?;
//! monitor.start_metrics_server(config.metrics_port)?;
//!
//! Server::builder()
//!     .layer(monitor.layer())
//!     .add_service(my_service)
//!     .serve(addr)
//!     .await?;
//! ```
//!
//! Code outside the request pipeline (background jobs) reports through
//! [`SpanReporter`].

pub mod config;
pub mod error;
pub mod fault;
pub mod interceptor;
pub mod layer;
pub mod metrics;
mod monitor;
pub mod server;
pub mod span;
pub mod tracker;

pub use config::{MonitorConfig, DEFAULT_BUCKETS};
pub use error::{BoxError, MonitorError, Result, SpanError};
pub use fault::{Fault, FaultPayload, MAX_STACK_SIZE};
pub use layer::{MonitoringLayer, ObservedCallLayer, RecoveryLayer, UNKNOWN_ENDPOINT};
pub use metrics::{Emitter, MonitorMetrics};
pub use monitor::Monitor;
pub use server::start_metrics_server;
pub use span::SpanReporter;
pub use tracker::{Dsn, DsnTracker, ErrorEvent, ErrorTracker, NoopTracker};
