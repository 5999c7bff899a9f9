//! Fault boundary for observed calls
//!
//! A panic raised while a call is running is caught at the boundary,
//! classified into a [`FaultPayload`], logged with the stack captured at the
//! panic site and reported as a failure. Reporting runs inside a second,
//! nested boundary, so a misbehaving emitter or error tracker can never let
//! a panic escape.
//!
//! The panic-site stack is recorded by a process-wide panic hook into a
//! thread-local slot. The hook chains to the previously installed one.

use crate::error::BoxError;
use crate::metrics::Emitter;
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use tonic::Status;

/// Upper bound for logged stack traces, in bytes
pub const MAX_STACK_SIZE: usize = 4096;

static HOOK: Once = Once::new();

thread_local! {
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Install the stack-capturing panic hook (idempotent)
pub fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let stack = Backtrace::force_capture().to_string();
            PANIC_STACK.with(|slot| *slot.borrow_mut() = Some(stack));
            previous(info);
        }));
    });
}

/// Take the stack recorded for the latest panic on this thread
pub fn take_panic_stack() -> Option<String> {
    PANIC_STACK
        .with(|slot| slot.borrow_mut().take())
        .map(|stack| truncate_stack(stack, MAX_STACK_SIZE))
}

fn truncate_stack(mut stack: String, max: usize) -> String {
    if stack.len() > max {
        let mut end = max;
        while !stack.is_char_boundary(end) {
            end -= 1;
        }
        stack.truncate(end);
    }
    stack
}

/// Render a raw panic payload as text
pub fn payload_text(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(status) = payload.downcast_ref::<Status>() {
        status.message().to_string()
    } else if let Some(err) = payload.downcast_ref::<BoxError>() {
        err.to_string()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Error built from a panic payload that was not error-shaped
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PanicMessage(pub String);

/// Classified panic payload
#[derive(Debug)]
pub enum FaultPayload {
    /// Raised with `panic_any` of a `tonic::Status` or a boxed error
    ErrorValue(BoxError),
    /// Anything else, kept as its text
    OtherValue(String),
}

impl FaultPayload {
    /// Classify a payload caught at the boundary
    pub fn classify(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<Status>() {
            Ok(status) => return FaultPayload::ErrorValue(status),
            Err(other) => other,
        };
        let payload = match payload.downcast::<BoxError>() {
            Ok(err) => return FaultPayload::ErrorValue(*err),
            Err(other) => other,
        };
        FaultPayload::OtherValue(payload_text(payload.as_ref()))
    }

    pub fn is_error_value(&self) -> bool {
        matches!(self, FaultPayload::ErrorValue(_))
    }

    /// Convert into an error, wrapping plain payloads in [`PanicMessage`]
    pub fn into_error(self) -> BoxError {
        match self {
            FaultPayload::ErrorValue(err) => err,
            FaultPayload::OtherValue(text) => Box::new(PanicMessage(text)),
        }
    }
}

impl fmt::Display for FaultPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultPayload::ErrorValue(err) => match err.downcast_ref::<Status>() {
                Some(status) => f.write_str(status.message()),
                None => write!(f, "{}", err),
            },
            FaultPayload::OtherValue(text) => f.write_str(text),
        }
    }
}

/// A caught panic together with its diagnostic context
#[derive(Debug)]
pub struct Fault {
    pub payload: FaultPayload,
    /// Stack at the panic site, at most [`MAX_STACK_SIZE`] bytes
    pub stack: String,
}

impl Fault {
    /// Build from a payload returned by `catch_unwind`
    pub fn capture(payload: Box<dyn Any + Send>) -> Self {
        let stack = take_panic_stack().unwrap_or_else(|| {
            truncate_stack(Backtrace::force_capture().to_string(), MAX_STACK_SIZE)
        });
        Self {
            payload: FaultPayload::classify(payload),
            stack,
        }
    }

    /// Generic status returned to gRPC callers
    pub fn to_status(&self) -> Status {
        Status::internal(format!("internal error: {}", self.payload))
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.payload)
    }
}

/// Run `f`, turning a panic into a [`Fault`]
pub fn guard<F, R>(f: F) -> Result<R, Fault>
where
    F: FnOnce() -> R,
{
    install_panic_hook();
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(Fault::capture)
}

/// Await `future`, turning a panic in any poll into a [`Fault`]
pub async fn guard_future<F>(future: F) -> Result<F::Output, Fault>
where
    F: Future,
{
    install_panic_hook();
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(Fault::capture)
}

/// Log a caught fault and record it as a failure of `endpoint`
///
/// A panic raised while recording is logged and swallowed.
pub fn report_fault(emitter: &dyn Emitter, endpoint: &str, fault: &Fault) {
    tracing::error!(
        endpoint = %endpoint,
        error = %fault.payload,
        stack = %fault.stack,
        "panic in grpc invoke"
    );

    let plain;
    let error: &(dyn std::error::Error + 'static) = match &fault.payload {
        FaultPayload::ErrorValue(err) => err.as_ref(),
        FaultPayload::OtherValue(text) => {
            plain = PanicMessage(text.clone());
            &plain
        }
    };

    let recorded = panic::catch_unwind(AssertUnwindSafe(|| {
        emitter.record_failure(endpoint, error)
    }));
    if let Err(secondary) = recorded {
        let trace = take_panic_stack().unwrap_or_default();
        tracing::error!(
            endpoint = %endpoint,
            error = %payload_text(secondary.as_ref()),
            stack = %trace,
            "report panic failed"
        );
    }
}
