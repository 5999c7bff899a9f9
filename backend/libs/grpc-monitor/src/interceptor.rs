//! Call-wrapping stages for unary handlers
//!
//! These wrap a handler future directly and are the building blocks of the
//! tower layers in [`crate::layer`]. They can also be used inside a tonic
//! service method body:
//!
//! ```ignore
//! async fn say_hello(
//!     &self,
//!     req: Request<HelloRequest>,
//! ) -> Result<Response<HelloReply>, Status> {
//!     let endpoint = "/helloworld.Greeter/SayHello";
//!     interceptor::observe(self.emitter.as_ref(), endpoint, async {
//!         // handler body
//!     })
//!     .await
//! }
//! ```

use crate::fault;
use crate::metrics::Emitter;
use std::future::Future;
use tokio::time::Instant;
use tonic::Status;

/// Milliseconds elapsed since `start`, with sub-millisecond precision
pub(crate) fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Latency/outcome stage
///
/// Times `handler`, records success with its latency or failure with its
/// error, and returns the result unchanged.
pub async fn monitoring<F, T, E>(emitter: &dyn Emitter, endpoint: &str, handler: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    let start = Instant::now();
    let result = handler.await;

    match &result {
        Ok(_) => emitter.record_success(endpoint, elapsed_ms(start)),
        Err(err) => emitter.record_failure(endpoint, err),
    }

    result
}

/// Fault-isolation stage
///
/// Passes the handler's result through. A panic inside `handler` is logged
/// with its stack, recorded as a failure and replaced by an `Internal`
/// status; it never unwinds past this function.
pub async fn recovery<F, T>(emitter: &dyn Emitter, endpoint: &str, handler: F) -> Result<T, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    match fault::guard_future(handler).await {
        Ok(result) => result,
        Err(fault) => {
            fault::report_fault(emitter, endpoint, &fault);
            Err(fault.to_status())
        }
    }
}

/// Both stages, fault isolation outermost
pub async fn observe<F, T>(emitter: &dyn Emitter, endpoint: &str, handler: F) -> Result<T, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    recovery(emitter, endpoint, monitoring(emitter, endpoint, handler)).await
}
