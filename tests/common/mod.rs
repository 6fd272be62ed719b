//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway HTTP backend servers, configuration builders,
//! and utility functions used across all integration test modules.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use switchyard::{
    BackendConfig, Config, HttpClient, Registry, RuntimeConfig, StrategySet, build_client,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

pub fn test_client() -> HttpClient {
    build_client()
}

/// Collects a [`Full<Bytes>`] response body into [`Bytes`].
pub async fn collect_body(body: Full<Bytes>) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

/// Builds a `RuntimeConfig` over the given `(id, address, weight)` backends.
pub fn test_config(backends: &[(&str, SocketAddr, u32)]) -> Arc<RuntimeConfig> {
    Arc::new(
        Config {
            backends: backends
                .iter()
                .map(|(id, addr, weight)| BackendConfig {
                    id: (*id).into(),
                    url: format!("http://{addr}"),
                    weight: *weight,
                })
                .collect(),
            ..Default::default()
        }
        .into_runtime()
        .expect("test config must be valid"),
    )
}

/// Builds a `RuntimeConfig` with a short request timeout, in milliseconds.
pub fn test_config_with_timeout(
    backends: &[(&str, SocketAddr, u32)],
    timeout_ms: u64,
) -> Arc<RuntimeConfig> {
    Arc::new(
        Config {
            backends: backends
                .iter()
                .map(|(id, addr, weight)| BackendConfig {
                    id: (*id).into(),
                    url: format!("http://{addr}"),
                    weight: *weight,
                })
                .collect(),
            request_timeout_ms: Some(timeout_ms),
            ..Default::default()
        }
        .into_runtime()
        .expect("test config must be valid"),
    )
}

/// Builds the registry and strategy set for a config, wired the way
/// `main` wires them.
pub fn test_pool(config: &RuntimeConfig) -> (Arc<Registry>, Arc<StrategySet>) {
    let registry = Arc::new(Registry::from_validated(
        &config.backends,
        config.latency_window_size,
    ));
    let strategies = Arc::new(StrategySet::new(
        config.ewma_alpha,
        config.virtual_nodes_per_backend,
    ));
    for strategy in strategies.iter() {
        registry.subscribe(Arc::clone(strategy));
    }
    strategies.init_all(&registry.all());
    (registry, strategies)
}

/// Starts a local HTTP server that responds to every request with the
/// given status and body. Returns the server address and a handle to
/// shut it down.
pub async fn start_backend(
    status: StatusCode,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(move |_req: Request<Incoming>| {
                        async move {
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .status(status)
                                    .header("content-type", "text/plain")
                                    .body(Full::new(Bytes::from(body)))
                                    .expect("test response must build"),
                            )
                        }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Starts a backend that echoes the request path and query as its body,
/// e.g. `"/api/users?key=val"`. Used to verify URI rewriting.
pub async fn start_echo_uri_backend() -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let echoed = req
                            .uri()
                            .path_and_query()
                            .map(|pq| pq.as_str().to_string())
                            .unwrap_or_default();
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", "text/plain")
                                .body(Full::new(Bytes::from(echoed)))
                                .expect("test response must build"),
                        )
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Starts a backend that echoes request headers, one `name: value` line
/// per header, sorted. Used to verify forwarded-header injection.
pub async fn start_echo_headers_backend() -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let mut lines = Vec::new();
                        for (name, value) in req.headers() {
                            if let Ok(v) = value.to_str() {
                                lines.push(format!("{}: {}", name.as_str(), v));
                            }
                        }
                        lines.sort();
                        let body = lines.join("\n");
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", "text/plain")
                                .body(Full::new(Bytes::from(body)))
                                .expect("test response must build"),
                        )
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Starts a backend that sleeps for the given duration before responding.
pub async fn start_slow_backend(delay: Duration) -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(move |_req: Request<Incoming>| async move {
                        tokio::time::sleep(delay).await;
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", "text/plain")
                                .body(Full::new(Bytes::from("slow")))
                                .expect("test response must build"),
                        )
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Builds a GET request with optional headers.
pub fn get_request(
    uri: &str,
    headers: &[(&str, &str)],
) -> Request<http_body_util::Empty<Bytes>> {
    let mut builder = Request::builder().method(hyper::Method::GET).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder
        .body(http_body_util::Empty::<Bytes>::new())
        .expect("test request must build")
}
