//! Standalone span reporting for code outside the gRPC pipeline
//!
//! Background jobs and other manually instrumented code report their own
//! outcome. Panics are reported the same way as in the request pipeline but
//! come back to the caller as [`SpanError::Panicked`].

use crate::error::SpanError;
use crate::fault;
use crate::interceptor::elapsed_ms;
use crate::metrics::Emitter;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Clone)]
pub struct SpanReporter {
    emitter: Arc<dyn Emitter>,
}

impl SpanReporter {
    pub fn new(emitter: Arc<dyn Emitter>) -> Self {
        Self { emitter }
    }

    /// Report the outcome of a span that started at `start`
    ///
    /// Records success with the elapsed latency or failure with the error.
    /// If recording panics, the panic is reported as a failure and returned
    /// as [`SpanError::Panicked`].
    pub fn report<T, E>(
        &self,
        endpoint: &str,
        start: impl Into<Instant>,
        result: Result<T, E>,
    ) -> Result<T, SpanError<E>>
    where
        E: std::error::Error + 'static,
    {
        let latency_ms = elapsed_ms(start.into());
        let emitter = self.emitter.as_ref();

        let recorded = fault::guard(|| match &result {
            Ok(_) => emitter.record_success(endpoint, latency_ms),
            Err(err) => emitter.record_failure(endpoint, err),
        });

        if let Err(fault) = recorded {
            fault::report_fault(emitter, endpoint, &fault);
            return Err(SpanError::Panicked(fault.payload.to_string()));
        }

        result.map_err(SpanError::Failed)
    }

    /// Run `f` as an instrumented span
    pub fn run<T, E, F>(&self, endpoint: &str, f: F) -> Result<T, SpanError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + 'static,
    {
        let start = Instant::now();
        match fault::guard(f) {
            Ok(result) => self.report(endpoint, start, result),
            Err(fault) => self.panicked(endpoint, fault),
        }
    }

    /// Await `future` as an instrumented span
    pub async fn run_async<T, E, F>(&self, endpoint: &str, future: F) -> Result<T, SpanError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let start = Instant::now();
        match fault::guard_future(future).await {
            Ok(result) => self.report(endpoint, start, result),
            Err(fault) => self.panicked(endpoint, fault),
        }
    }

    fn panicked<T, E>(&self, endpoint: &str, fault: fault::Fault) -> Result<T, SpanError<E>> {
        fault::report_fault(self.emitter.as_ref(), endpoint, &fault);
        Err(SpanError::Panicked(fault.payload.to_string()))
    }
}
