//! DLX request-path tests: header handling, forwarding to a real upstream,
//! holding during scale-from-zero, timeouts and backpressure.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tower::ServiceExt;

use zeroscale_autoscale::Activator;
use zeroscale_dlx::{Dlx, REQUESTS_METRIC, RequestCounter};
use zeroscale_state::*;

struct WakeBackend {
    wake_calls: AtomicUsize,
    delay: Duration,
    fail: AtomicBool,
}

impl WakeBackend {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            wake_calls: AtomicUsize::new(0),
            delay,
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ResourceScaler for WakeBackend {
    async fn set_scale(&self, _resource: &str, replicas: u32) -> Result<(), BackendError> {
        if replicas > 0 {
            self.wake_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(BackendError::Request("no capacity".into()));
            }
        }
        Ok(())
    }

    async fn get_resources(&self) -> Result<Vec<Resource>, BackendError> {
        Ok(Vec::new())
    }

    async fn get_config(&self) -> Result<ResourceScalerConfig, BackendError> {
        Ok(RawScalerConfig::default().validate()?)
    }
}

/// Plain hyper server answering `<method> <uri>` and echoing the Host it saw.
async fn upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(|req: hyper::Request<Incoming>| async move {
                    let host = req
                        .headers()
                        .get(header::HOST)
                        .cloned()
                        .unwrap_or_else(|| header::HeaderValue::from_static(""));
                    let body = format!("{} {}", req.method(), req.uri());
                    Ok::<_, Infallible>(
                        hyper::Response::builder()
                            .header("x-upstream-host", host)
                            .body(Full::new(Bytes::from(body)))
                            .unwrap(),
                    )
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

fn options(port: u16, readiness_timeout: Duration, max_held_requests: usize) -> DlxOptions {
    let mut options = RawScalerConfig::default().validate().unwrap().dlx;
    options.target_host = "127.0.0.1".into();
    options.target_port = port;
    options.readiness_timeout = readiness_timeout;
    options.max_held_requests = max_held_requests;
    options
}

struct Setup {
    registry: Registry,
    backend: Arc<WakeBackend>,
    dlx: Dlx,
}

async fn setup(backend: Arc<WakeBackend>, options: DlxOptions) -> Setup {
    let registry = Registry::new();
    registry.upsert(Resource::new("r1", vec![])).await;
    let activator = Activator::new(registry.clone(), backend.clone(), Duration::from_secs(120))
        .with_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 1));
    let dlx = Dlx::new(registry.clone(), activator, RequestCounter::new(), options);
    Setup {
        registry,
        backend,
        dlx,
    }
}

async fn drive(registry: &Registry, name: &str, path: &[ScaleState]) {
    let slot = registry.get(name).await.unwrap();
    let mut record = slot.lock().await;
    for state in path {
        record.transition(*state).unwrap();
    }
}

const TO_ZERO: &[ScaleState] = &[
    ScaleState::ScalingFromZero,
    ScaleState::ScaledFromZero,
    ScaleState::ScalingToZero,
    ScaleState::ScaledToZero,
];

fn request(resource: &str, path: &str) -> Request<Body> {
    Request::builder()
        .uri("/")
        .header(DEFAULT_NAME_HEADER, resource)
        .header(DEFAULT_PATH_HEADER, path)
        .body(Body::empty())
        .unwrap()
}

/// One HTTP/1.1 request over a fresh connection; returns the status line.
async fn send(addr: SocketAddr, resource: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\nHost: dlx\r\n{DEFAULT_NAME_HEADER}: {resource}\r\n{DEFAULT_PATH_HEADER}: /\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    let _ = stream.read_to_string(&mut response).await;
    response.lines().next().unwrap_or_default().to_string()
}

async fn wait_until_held(dlx: &Dlx, resource: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while dlx.gate().held(resource).await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("request was never held");
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn missing_headers_are_rejected() {
    let s = setup(WakeBackend::new(Duration::ZERO), options(1, Duration::from_secs(2), 8)).await;

    let req = Request::builder()
        .uri("/")
        .header(DEFAULT_PATH_HEADER, "/")
        .body(Body::empty())
        .unwrap();
    let resp = s.dlx.router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = Request::builder()
        .uri("/")
        .header(DEFAULT_NAME_HEADER, "r1")
        .body(Body::empty())
        .unwrap();
    let resp = s.dlx.router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = s.dlx.router().oneshot(request("r1", "no-slash")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_resource_is_not_found() {
    let s = setup(WakeBackend::new(Duration::ZERO), options(1, Duration::from_secs(2), 8)).await;
    let resp = s.dlx.router().oneshot(request("nope", "/")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert!(body_string(resp).await.contains("nope"));
}

#[tokio::test]
async fn serving_resource_is_forwarded() {
    let addr = upstream().await;
    let s = setup(
        WakeBackend::new(Duration::ZERO),
        options(addr.port(), Duration::from_secs(2), 8),
    )
    .await;

    let resp = s
        .dlx
        .router()
        .oneshot(request("r1", "/hello?x=1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["x-upstream-host"],
        format!("127.0.0.1:{}", addr.port()).as_str()
    );
    assert_eq!(body_string(resp).await, "GET /hello?x=1");
    assert_eq!(s.backend.wake_calls.load(Ordering::SeqCst), 0);
    assert_eq!(s.dlx.counter().pending("r1").await, 1);
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    // Bind then drop to get a port nothing listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let s = setup(WakeBackend::new(Duration::ZERO), options(port, Duration::from_secs(2), 8)).await;

    let resp = s.dlx.router().oneshot(request("r1", "/")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn concurrent_requests_share_one_wake() {
    let addr = upstream().await;
    let s = setup(
        WakeBackend::new(Duration::from_millis(200)),
        options(addr.port(), Duration::from_secs(10), 1024),
    )
    .await;
    drive(&s.registry, "r1", TO_ZERO).await;

    let mut requests = JoinSet::new();
    for i in 0..50 {
        let router = s.dlx.router();
        requests.spawn(async move {
            let resp = router
                .oneshot(request("r1", &format!("/item/{i}")))
                .await
                .unwrap();
            (resp.status(), body_string(resp).await)
        });
    }

    let mut forwarded = 0;
    while let Some(joined) = requests.join_next().await {
        let (status, body) = joined.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("GET /item/"));
        forwarded += 1;
    }

    assert_eq!(forwarded, 50);
    assert_eq!(s.backend.wake_calls.load(Ordering::SeqCst), 1);
    let snapshot = s.registry.snapshot_of("r1").await.unwrap();
    assert_eq!(snapshot.state, ScaleState::ScaledFromZero);
    assert_eq!(s.dlx.counter().pending("r1").await, 50);
}

#[tokio::test(start_paused = true)]
async fn held_request_times_out() {
    let s = setup(
        WakeBackend::new(Duration::from_secs(5)),
        options(1, Duration::from_secs(2), 8),
    )
    .await;
    drive(&s.registry, "r1", TO_ZERO).await;

    let start = Instant::now();
    let resp = s.dlx.router().oneshot(request("r1", "/")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(start.elapsed() < Duration::from_millis(2100));

    // The wake keeps going after the request gave up.
    assert_eq!(
        s.registry.snapshot_of("r1").await.unwrap().state,
        ScaleState::ScalingFromZero
    );
    assert_eq!(s.dlx.gate().held("r1").await, 0);
}

#[tokio::test(start_paused = true)]
async fn held_requests_are_capped() {
    let s = setup(
        WakeBackend::new(Duration::from_secs(60)),
        options(1, Duration::from_secs(30), 1),
    )
    .await;
    drive(&s.registry, "r1", TO_ZERO).await;

    let router = s.dlx.router();
    let first = tokio::spawn(async move { router.oneshot(request("r1", "/")).await.unwrap() });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(s.dlx.gate().held("r1").await, 1);

    let resp = s.dlx.router().oneshot(request("r1", "/")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(resp.headers().contains_key(header::RETRY_AFTER));

    assert_eq!(first.await.unwrap().status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn failed_wake_is_unavailable() {
    let backend = WakeBackend::new(Duration::ZERO);
    backend.fail.store(true, Ordering::SeqCst);
    let s = setup(backend, options(1, Duration::from_secs(10), 8)).await;
    drive(&s.registry, "r1", TO_ZERO).await;

    let resp = s.dlx.router().oneshot(request("r1", "/")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(resp.headers().contains_key(header::RETRY_AFTER));

    let snapshot = s.registry.snapshot_of("r1").await.unwrap();
    assert_eq!(snapshot.state, ScaleState::Non);
    assert!(snapshot.degraded.is_some());
}

#[tokio::test]
async fn request_during_scale_down_keeps_replicas() {
    let addr = upstream().await;
    let s = setup(
        WakeBackend::new(Duration::ZERO),
        options(addr.port(), Duration::from_secs(2), 8),
    )
    .await;
    drive(
        &s.registry,
        "r1",
        &[
            ScaleState::ScalingFromZero,
            ScaleState::ScaledFromZero,
            ScaleState::ScalingToZero,
        ],
    )
    .await;

    let resp = s.dlx.router().oneshot(request("r1", "/")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        s.registry.snapshot_of("r1").await.unwrap().state,
        ScaleState::ScaledFromZero
    );
    assert_eq!(s.backend.wake_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn routed_requests_feed_the_request_metric() {
    let s = setup(WakeBackend::new(Duration::ZERO), options(1, Duration::from_secs(2), 8)).await;

    // Counted even though the upstream is unreachable.
    for _ in 0..3 {
        s.dlx.router().oneshot(request("r1", "/")).await.unwrap();
    }
    let range = TimeRange::last(Duration::from_secs(30));
    let samples = s
        .dlx
        .counter()
        .query("r1", REQUESTS_METRIC, range)
        .await
        .unwrap();
    assert_eq!(samples[0].value, 3.0);
}

#[tokio::test]
async fn serve_stops_on_shutdown() {
    let s = setup(WakeBackend::new(Duration::ZERO), options(1, Duration::from_secs(2), 8)).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(s.dlx.clone().serve(listener, rx));

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("dlx did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn busy_resource_does_not_extend_the_deadline() {
    let s = setup(
        WakeBackend::new(Duration::from_secs(20)),
        options(1, Duration::from_secs(2), 1),
    )
    .await;
    drive(&s.registry, "r1", TO_ZERO).await;

    // Someone else holds the resource far longer than the readiness timeout.
    let slot = s.registry.get("r1").await.unwrap();
    let busy = slot.lock().await;

    let start = Instant::now();
    let resp = s.dlx.router().oneshot(request("r1", "/")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(start.elapsed() < Duration::from_millis(2100));
    drop(busy);
}

#[tokio::test]
async fn removed_resource_stops_counting() {
    let s = setup(WakeBackend::new(Duration::ZERO), options(1, Duration::from_secs(2), 8)).await;
    s.dlx.router().oneshot(request("r1", "/")).await.unwrap();
    assert_eq!(s.dlx.counter().pending("r1").await, 1);

    s.registry.remove("r1").await;
    s.dlx.forget("r1").await;
    assert_eq!(s.dlx.counter().pending("r1").await, 0);

    let resp = s.dlx.router().oneshot(request("r1", "/")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(s.dlx.counter().pending("r1").await, 0);

    // Re-created under the same name: counting starts from zero.
    s.registry.upsert(Resource::new("r1", vec![])).await;
    s.dlx.router().oneshot(request("r1", "/")).await.unwrap();
    assert_eq!(s.dlx.counter().pending("r1").await, 1);
}

#[tokio::test]
async fn shutdown_lets_held_request_finish() {
    let addr = upstream().await;
    let mut opts = options(addr.port(), Duration::from_secs(5), 8);
    opts.drain_timeout = Duration::from_secs(5);
    let s = setup(WakeBackend::new(Duration::from_millis(300)), opts).await;
    drive(&s.registry, "r1", TO_ZERO).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dlx_addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::watch::channel(false);
    let serving = tokio::spawn(s.dlx.clone().serve(listener, rx));

    let client = tokio::spawn(send(dlx_addr, "r1"));
    wait_until_held(&s.dlx, "r1").await;

    let start = Instant::now();
    tx.send(true).unwrap();
    assert!(client.await.unwrap().contains("200"));
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("dlx did not stop")
        .unwrap()
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn shutdown_lets_held_request_time_out() {
    let mut opts = options(1, Duration::from_millis(300), 8);
    opts.drain_timeout = Duration::from_secs(5);
    let s = setup(WakeBackend::new(Duration::from_secs(30)), opts).await;
    drive(&s.registry, "r1", TO_ZERO).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dlx_addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::watch::channel(false);
    let serving = tokio::spawn(s.dlx.clone().serve(listener, rx));

    let client = tokio::spawn(send(dlx_addr, "r1"));
    wait_until_held(&s.dlx, "r1").await;

    let start = Instant::now();
    tx.send(true).unwrap();
    assert!(client.await.unwrap().contains("504"));
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("dlx did not stop")
        .unwrap()
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn drain_timeout_bounds_shutdown() {
    let mut opts = options(1, Duration::from_secs(30), 8);
    opts.drain_timeout = Duration::from_millis(300);
    let s = setup(WakeBackend::new(Duration::from_secs(60)), opts).await;
    drive(&s.registry, "r1", TO_ZERO).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dlx_addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::watch::channel(false);
    let serving = tokio::spawn(s.dlx.clone().serve(listener, rx));

    let _client = tokio::spawn(send(dlx_addr, "r1"));
    wait_until_held(&s.dlx, "r1").await;

    let start = Instant::now();
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("dlx did not stop")
        .unwrap()
        .unwrap();
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert!(start.elapsed() < Duration::from_secs(2));
}
