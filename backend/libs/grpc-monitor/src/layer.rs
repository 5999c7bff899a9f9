//! Tower layers for tonic servers
//!
//! ```ignore
//! let monitor = Monitor::new(&config)?;
//! Server::builder()
//!     .layer(monitor.layer())
//!     .add_service(GreeterServer::new(greeter))
//!     .serve(addr)
//!     .await?;
//! ```
//!
//! The endpoint label is the request path (`/package.Service/Method`). A
//! handler error is detected from the `grpc-status` response header, which
//! is where tonic puts the status of a failed unary call. Statuses sent in
//! trailers after a streamed body are not inspected. `Unimplemented`
//! responses are recorded under [`UNKNOWN_ENDPOINT`].

use crate::fault::{self, Fault};
use crate::interceptor::elapsed_ms;
use crate::metrics::Emitter;
use futures::future::{self, BoxFuture};
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Request, Response};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::Instant;
use tonic::{Code, Status};
use tower::layer::util::Stack;
use tower::{Layer, Service};

/// Endpoint label shared by all `Unimplemented` responses
///
/// The router answers unknown paths with `Unimplemented`.
pub const UNKNOWN_ENDPOINT: &str = "unknown";

/// Both layers, recovery outermost
pub type ObservedCallLayer = Stack<MonitoringLayer, RecoveryLayer>;

/// Build the full observed-call stack around `emitter`
pub fn observed_call_layer(emitter: Arc<dyn Emitter>) -> ObservedCallLayer {
    Stack::new(
        MonitoringLayer::new(emitter.clone()),
        RecoveryLayer::new(emitter),
    )
}

/// Failed status carried in response headers, if any
pub fn grpc_failure(headers: &HeaderMap) -> Option<Status> {
    Status::from_header_map(headers).filter(|status| status.code() != Code::Ok)
}

/// Render `status` as a trailers-only gRPC response
pub fn status_response<B: Default>(status: &Status) -> Response<B> {
    let mut response = Response::new(B::default());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));

    if let Err(e) = status.add_header(headers) {
        tracing::warn!(error = %e, "failed to encode grpc status headers");
        headers.insert("grpc-status", HeaderValue::from(Code::Internal as i32));
    }

    response
}

/// Latency/outcome layer
#[derive(Clone)]
pub struct MonitoringLayer {
    emitter: Arc<dyn Emitter>,
}

impl MonitoringLayer {
    pub fn new(emitter: Arc<dyn Emitter>) -> Self {
        Self { emitter }
    }
}

impl<S> Layer<S> for MonitoringLayer {
    type Service = MonitoringService<S>;

    fn layer(&self, service: S) -> Self::Service {
        MonitoringService {
            inner: service,
            emitter: self.emitter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MonitoringService<S> {
    inner: S,
    emitter: Arc<dyn Emitter>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MonitoringService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: std::fmt::Display + Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let endpoint = req.uri().path().to_string();
        let emitter = self.emitter.clone();
        let start = Instant::now();
        let future = self.inner.call(req);

        Box::pin(async move {
            let result = future.await;

            match &result {
                Ok(response) => match grpc_failure(response.headers()) {
                    None => emitter.record_success(&endpoint, elapsed_ms(start)),
                    Some(status) if status.code() == Code::Unimplemented => {
                        emitter.record_failure(UNKNOWN_ENDPOINT, &status)
                    }
                    Some(status) => emitter.record_failure(&endpoint, &status),
                },
                Err(e) => {
                    let status = Status::unknown(e.to_string());
                    emitter.record_failure(&endpoint, &status);
                }
            }

            result
        })
    }
}

/// Fault-isolation layer
#[derive(Clone)]
pub struct RecoveryLayer {
    emitter: Arc<dyn Emitter>,
}

impl RecoveryLayer {
    pub fn new(emitter: Arc<dyn Emitter>) -> Self {
        Self { emitter }
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RecoveryService {
            inner: service,
            emitter: self.emitter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RecoveryService<S> {
    inner: S,
    emitter: Arc<dyn Emitter>,
}

fn fault_response<B: Default>(emitter: &dyn Emitter, endpoint: &str, fault: Fault) -> Response<B> {
    fault::report_fault(emitter, endpoint, &fault);
    status_response(&fault.to_status())
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RecoveryService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let endpoint = req.uri().path().to_string();
        let emitter = self.emitter.clone();
        let inner = &mut self.inner;

        match fault::guard(move || inner.call(req)) {
            Ok(future) => Box::pin(async move {
                match fault::guard_future(future).await {
                    Ok(result) => result,
                    Err(fault) => Ok(fault_response(emitter.as_ref(), &endpoint, fault)),
                }
            }),
            Err(fault) => {
                let response = fault_response(emitter.as_ref(), &endpoint, fault);
                Box::pin(future::ready(Ok(response)))
            }
        }
    }
}
