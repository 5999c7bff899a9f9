/// Integration tests for the observed-call pipeline
use grpc_monitor::layer::{grpc_failure, status_response};
use grpc_monitor::{
    Emitter, ErrorEvent, ErrorTracker, Monitor, MonitorConfig, MonitorMetrics, SpanError,
    DEFAULT_BUCKETS, UNKNOWN_ENDPOINT,
};
use http::{Request, Response};
use parking_lot::Mutex;
use prometheus::core::Metric;
use prometheus::Registry;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tonic::{Code, Status};
use tower::{service_fn, Layer, Service, ServiceExt};
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ==================== Test doubles ====================

#[derive(Default)]
struct RecordingTracker {
    events: Mutex<Vec<ErrorEvent>>,
}

impl ErrorTracker for RecordingTracker {
    fn capture(&self, event: ErrorEvent) {
        self.events.lock().push(event);
    }
}

struct PanickingTracker;

impl ErrorTracker for PanickingTracker {
    fn capture(&self, _event: ErrorEvent) {
        panic!("error tracker unreachable");
    }
}

#[derive(Default)]
struct CountingEmitter {
    successes: AtomicUsize,
    failures: AtomicUsize,
}

impl CountingEmitter {
    fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl Emitter for CountingEmitter {
    fn record_success(&self, _endpoint: &str, latency_ms: f64) {
        assert!(latency_ms >= 0.0);
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn record_failure(&self, _endpoint: &str, _error: &(dyn std::error::Error + 'static)) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

fn monitor_with_tracker(
    application: &str,
    tracker: Arc<dyn ErrorTracker>,
) -> (Monitor, MonitorMetrics) {
    let metrics = MonitorMetrics::new(application, 7000, tracker, &DEFAULT_BUCKETS).unwrap();
    metrics.register(&Registry::new()).unwrap();
    (Monitor::with_emitter(Arc::new(metrics.clone())), metrics)
}

async fn divide(a: i64, b: i64) -> Result<i64, Status> {
    if b == 0 {
        panic!("divide by zero");
    }
    Ok(a / b)
}

// ==================== Call scenarios ====================

#[tokio::test(start_paused = true)]
async fn test_success_latency_lands_in_bucket() {
    let config = MonitorConfig::new("itest_latency", 7000);
    let monitor = Monitor::with_registry(&config, Registry::new()).unwrap();

    let result = monitor
        .observe("/helloworld.Greeter/SayHello", async {
            tokio::time::sleep(Duration::from_millis(25)).await;
            Ok::<_, Status>("hello")
        })
        .await;
    assert_eq!(assert_ok!(result), "hello");

    let metrics = monitor.metrics().unwrap();
    assert_eq!(metrics.request_count("/helloworld.Greeter/SayHello"), 1);
    assert_eq!(metrics.error_count("/helloworld.Greeter/SayHello"), 0);

    let histogram = metrics.latency_histogram("/helloworld.Greeter/SayHello");
    let proto = histogram.metric();
    let buckets = proto.get_histogram().get_bucket();
    let cumulative = |upper: f64| {
        buckets
            .iter()
            .find(|b| b.get_upper_bound() == upper)
            .map(|b| b.get_cumulative_count())
            .unwrap()
    };
    assert_eq!(cumulative(20.0), 0);
    assert_eq!(cumulative(30.0), 1);
}

#[tokio::test]
async fn test_handler_error_is_recorded_and_passed_through() {
    let tracker = Arc::new(RecordingTracker::default());
    let (monitor, metrics) = monitor_with_tracker("itest_error", tracker.clone());

    let result = monitor
        .observe("/users.Users/Get", async {
            Err::<(), _>(Status::not_found("user 42 not found"))
        })
        .await;

    let status = assert_err!(result);
    assert_eq!(status.code(), Code::NotFound);
    assert_eq!(status.message(), "user 42 not found");

    assert_eq!(metrics.error_count("/users.Users/Get"), 1);
    assert_eq!(metrics.request_count("/users.Users/Get"), 0);

    let events = tracker.events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].endpoint(), Some("/users.Users/Get"));
    assert_eq!(events[0].message, "user 42 not found");
    assert_eq!(events[0].grpc_code(), Some("NotFound"));
}

#[tokio::test]
async fn test_panic_becomes_internal_error() {
    init_tracing();
    let tracker = Arc::new(RecordingTracker::default());
    let (monitor, metrics) = monitor_with_tracker("itest_fault", tracker.clone());

    let result = monitor.observe("/calc.Calc/Divide", divide(1, 0)).await;

    let status = assert_err!(result);
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("internal error"));
    assert!(status.message().contains("divide by zero"));

    assert_eq!(metrics.error_count("/calc.Calc/Divide"), 1);
    assert_eq!(metrics.request_count("/calc.Calc/Divide"), 0);
    assert_eq!(tracker.events.lock()[0].message, "divide by zero");

    // the process keeps serving
    let next = monitor.observe("/calc.Calc/Divide", divide(6, 3)).await;
    assert_eq!(assert_ok!(next), 2);
    assert_eq!(metrics.request_count("/calc.Calc/Divide"), 1);
}

/// In-memory log sink for asserting on emitted events
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_panic_is_logged_with_endpoint_and_stack() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let monitor = Monitor::with_emitter(Arc::new(CountingEmitter::default()));
    let result = monitor.observe("/calc.Calc/Divide", divide(1, 0)).await;
    assert_err!(result);

    let output = logs.contents();
    let line_start = output
        .find("panic in grpc invoke")
        .expect("fault event was not logged");
    let event = &output[line_start..];
    assert!(event.contains("endpoint=/calc.Calc/Divide"), "{}", event);
    assert!(event.contains("error=divide by zero"), "{}", event);

    let stack = &event[event.find("stack=").expect("stack field missing") + "stack=".len()..];
    assert!(!stack.trim().is_empty());
}

#[tokio::test]
async fn test_panicking_tracker_still_yields_internal_error() {
    init_tracing();
    let (monitor, metrics) = monitor_with_tracker("itest_secondary", Arc::new(PanickingTracker));

    let result = monitor.observe("/calc.Calc/Divide", divide(1, 0)).await;

    let status = assert_err!(result);
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("divide by zero"));
    assert_eq!(metrics.error_count("/calc.Calc/Divide"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_emit_exactly_once() {
    let emitter = Arc::new(CountingEmitter::default());
    let monitor = Monitor::with_emitter(emitter.clone());
    let calls = 300;

    let mut handles = Vec::with_capacity(calls);
    for i in 0..calls {
        let monitor = monitor.clone();
        handles.push(tokio::spawn(async move {
            monitor
                .observe("/load.Load/Hit", async move {
                    tokio::task::yield_now().await;
                    match i % 3 {
                        0 => Ok(i),
                        1 => Err(Status::unavailable("busy")),
                        _ => divide(1, 0).await.map(|_| i),
                    }
                })
                .await
        }));
    }

    for handle in handles {
        // no task may fail: panics never escape the boundary
        assert_ok!(handle.await);
    }

    assert_eq!(emitter.successes() + emitter.failures(), calls);
    assert_eq!(emitter.successes(), calls / 3);
    assert_eq!(emitter.failures(), calls - calls / 3);
}

// ==================== Tower stack ====================

async fn greeter(req: Request<String>) -> Result<Response<String>, Infallible> {
    match req.uri().path() {
        "/helloworld.Greeter/SayHello" => Ok(Response::new("hello".to_string())),
        "/helloworld.Greeter/Divide" => panic!("divide by zero"),
        _ => Ok(status_response(&Status::unimplemented("unknown method"))),
    }
}

fn grpc_request(path: &str) -> Request<String> {
    Request::builder()
        .uri(format!("http://localhost{}", path))
        .body(String::new())
        .unwrap()
}

#[tokio::test]
async fn test_layer_stack_outcomes() {
    let emitter = Arc::new(CountingEmitter::default());
    let monitor = Monitor::with_emitter(emitter.clone());
    let mut service = monitor.layer().layer(service_fn(greeter));

    let response = service
        .ready()
        .await
        .unwrap()
        .call(grpc_request("/helloworld.Greeter/SayHello"))
        .await
        .unwrap();
    assert!(grpc_failure(response.headers()).is_none());
    assert_eq!(response.body(), "hello");
    assert_eq!((emitter.successes(), emitter.failures()), (1, 0));

    let response = service
        .ready()
        .await
        .unwrap()
        .call(grpc_request("/helloworld.Greeter/Nope"))
        .await
        .unwrap();
    assert_eq!(grpc_failure(response.headers()).unwrap().code(), Code::Unimplemented);
    assert_eq!((emitter.successes(), emitter.failures()), (1, 1));

    let response = service
        .ready()
        .await
        .unwrap()
        .call(grpc_request("/helloworld.Greeter/Divide"))
        .await
        .unwrap();
    let status = grpc_failure(response.headers()).unwrap();
    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "internal error: divide by zero");
    assert_eq!((emitter.successes(), emitter.failures()), (1, 2));
}

#[tokio::test]
async fn test_unknown_paths_do_not_grow_the_registry() {
    let config = MonitorConfig::new("itest_unknown", 7000);
    let monitor = Monitor::with_registry(&config, Registry::new()).unwrap();
    let layer = monitor.layer();

    for i in 0..500 {
        let response = layer
            .layer(service_fn(greeter))
            .oneshot(grpc_request(&format!("/random{}/x", i)))
            .await
            .unwrap();
        assert_eq!(grpc_failure(response.headers()).unwrap().code(), Code::Unimplemented);
    }

    let error_series = monitor
        .registry()
        .gather()
        .iter()
        .find(|mf| mf.get_name() == "itest_unknown_error_total")
        .map(|mf| mf.get_metric().len())
        .unwrap();
    assert_eq!(error_series, 1);
    assert_eq!(monitor.metrics().unwrap().error_count(UNKNOWN_ENDPOINT), 500);
}

/// Panics while building the response future
#[derive(Clone)]
struct PanicOnCall;

impl Service<Request<String>> for PanicOnCall {
    type Response = Response<String>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<String>) -> Self::Future {
        panic!("router exploded");
    }
}

#[tokio::test]
async fn test_recovery_layer_catches_panic_in_call() {
    let emitter = Arc::new(CountingEmitter::default());
    let monitor = Monitor::with_emitter(emitter.clone());

    let response = monitor
        .recovery_layer()
        .layer(PanicOnCall)
        .oneshot(grpc_request("/svc.Svc/Any"))
        .await
        .unwrap();

    let status = grpc_failure(response.headers()).unwrap();
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("router exploded"));
    assert_eq!(emitter.failures(), 1);
}

// ==================== Span reporter ====================

#[tokio::test]
async fn test_span_reporter_for_background_jobs() {
    let emitter = Arc::new(CountingEmitter::default());
    let reporter = Monitor::with_emitter(emitter.clone()).span_reporter();

    let ok = reporter
        .run_async("job.reindex", async { Ok::<_, std::io::Error>(10) })
        .await;
    assert_eq!(assert_ok!(ok), 10);

    let panicked = reporter
        .run_async("job.reindex", async {
            divide(1, 0)
                .await
                .map_err(|s| std::io::Error::new(std::io::ErrorKind::Other, s.to_string()))
        })
        .await;
    match panicked {
        Err(SpanError::Panicked(text)) => assert_eq!(text, "divide by zero"),
        other => panic!("unexpected result: {:?}", other),
    }

    let start = std::time::Instant::now();
    let failed: Result<(), _> = reporter.report(
        "job.reindex",
        start,
        Err(std::io::Error::new(std::io::ErrorKind::Other, "index locked")),
    );
    assert!(matches!(failed, Err(SpanError::Failed(_))));

    assert_eq!((emitter.successes(), emitter.failures()), (1, 2));
}

// ==================== External endpoints ====================

#[tokio::test]
async fn test_metrics_endpoint_exposes_call_metrics() {
    let config = MonitorConfig::new("itest_exposition", 7000);
    let monitor = Monitor::with_registry(&config, Registry::new()).unwrap();

    let _ = monitor.observe("/svc.Svc/A", async { Ok::<_, Status>(()) }).await;
    let _ = monitor
        .observe("/svc.Svc/A", async { Err::<(), _>(Status::internal("db")) })
        .await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(grpc_monitor::server::serve_metrics(
        listener,
        monitor.registry().clone(),
    ));

    let body = reqwest::get(format!("http://{}/metrics", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(body.contains("itest_exposition_requests_total{"));
    assert!(body.contains("itest_exposition_error_total{"));
    assert!(body.contains("itest_exposition_response_latency_millisecond_bucket{"));
    assert!(body.contains(r#"endpoint="/svc.Svc/A""#));
    assert!(body.contains(r#"process="7000""#));

    server.abort();
}

#[tokio::test]
async fn test_errors_delivered_to_dsn_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/42/store/"))
        .and(header_exists("x-sentry-auth"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dsn = format!("http://publickey@{}/42", server.address());
    let config = MonitorConfig::new("itest_tracker", 7000).with_tracker_dsn(dsn);
    let monitor = Monitor::with_registry(&config, Registry::new()).unwrap();

    let result = monitor.observe("/calc.Calc/Divide", divide(1, 0)).await;
    assert_err!(result);

    let mut delivered = Vec::new();
    for _ in 0..100 {
        delivered = server.received_requests().await.unwrap_or_default();
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(delivered.len(), 1);
    let event: serde_json::Value = serde_json::from_slice(&delivered[0].body).unwrap();
    assert_eq!(event["message"], "divide by zero");
    assert_eq!(event["tags"]["endpoint"], "/calc.Calc/Divide");
    assert_eq!(event["level"], "error");

    server.verify().await;
}

#[test]
fn test_monitor_rejects_malformed_dsn() {
    let config = MonitorConfig::new("itest_bad_dsn", 7000).with_tracker_dsn("https://no-project");
    assert!(Monitor::with_registry(&config, Registry::new()).is_err());
}
