//! Integration tests for the dispatch pipeline: forwarding, error
//! classification, connection accounting, and health probing.

mod common;

use std::time::Duration;

use common::*;
use hyper::StatusCode;
use switchyard::{BalancerError, handle_request, probe_backend};

#[tokio::test]
async fn forwards_to_backend_and_returns_body() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "hello from backend").await;

    let config = test_config(&[("s1", addr, 1)]);
    let (registry, strategies) = test_pool(&config);

    let resp = handle_request(
        get_request("http://lb.local/api/data", &[]),
        test_client(),
        config,
        registry.clone(),
        strategies,
        test_addr(),
    )
    .await
    .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = collect_body(resp.into_body()).await;
    assert_eq!(body, "hello from backend");

    // The dispatch released its claimed connection.
    assert_eq!(registry.get("s1").unwrap().current_connections(), 0);
    assert_eq!(registry.get("s1").unwrap().total_requests(), 1);
}

#[tokio::test]
async fn empty_pool_returns_503() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "up").await;

    let config = test_config(&[("s1", addr, 1)]);
    let (registry, strategies) = test_pool(&config);
    registry.set_healthy("s1", false);

    let err = handle_request(
        get_request("http://lb.local/api", &[]),
        test_client(),
        config,
        registry,
        strategies,
        test_addr(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, BalancerError::NoHealthyBackend));
    assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unknown_algorithm_returns_400() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "up").await;

    let config = test_config(&[("s1", addr, 1)]);
    let (registry, strategies) = test_pool(&config);

    let err = handle_request(
        get_request("http://lb.local/api?algorithm=fastest", &[]),
        test_client(),
        config,
        registry.clone(),
        strategies,
        test_addr(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, BalancerError::UnknownAlgorithm(_)));
    assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

    // Rejected before selection: nothing was claimed.
    assert_eq!(registry.get("s1").unwrap().current_connections(), 0);
}

#[tokio::test]
async fn backend_error_status_returns_502_and_releases_connection() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::INTERNAL_SERVER_ERROR, "boom").await;

    let config = test_config(&[("s1", addr, 1)]);
    let (registry, strategies) = test_pool(&config);

    let err = handle_request(
        get_request("http://lb.local/api", &[]),
        test_client(),
        config,
        registry.clone(),
        strategies,
        test_addr(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, BalancerError::Upstream(_)));
    assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    assert_eq!(registry.get("s1").unwrap().current_connections(), 0);
}

#[tokio::test]
async fn unreachable_backend_returns_502() {
    init_tracing();
    // Port 1 on localhost is refused immediately.
    let addr = "127.0.0.1:1".parse().unwrap();

    let config = test_config(&[("s1", addr, 1)]);
    let (registry, strategies) = test_pool(&config);

    let err = handle_request(
        get_request("http://lb.local/api", &[]),
        test_client(),
        config,
        registry.clone(),
        strategies,
        test_addr(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, BalancerError::Upstream(_)));
    assert_eq!(registry.get("s1").unwrap().current_connections(), 0);
}

#[tokio::test]
async fn slow_backend_times_out_with_502() {
    init_tracing();
    let (addr, _shutdown) = start_slow_backend(Duration::from_secs(5)).await;

    let config = test_config_with_timeout(&[("s1", addr, 1)], 200);
    let (registry, strategies) = test_pool(&config);

    let err = handle_request(
        get_request("http://lb.local/api", &[]),
        test_client(),
        config,
        registry.clone(),
        strategies,
        test_addr(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, BalancerError::Timeout(_)));
    assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    assert_eq!(registry.get("s1").unwrap().current_connections(), 0);
}

#[tokio::test]
async fn non_get_requests_are_rejected() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "up").await;

    let config = test_config(&[("s1", addr, 1)]);
    let (registry, strategies) = test_pool(&config);

    let req = hyper::Request::builder()
        .method(hyper::Method::POST)
        .uri("http://lb.local/api")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .unwrap();

    let resp = handle_request(
        req,
        test_client(),
        config,
        registry,
        strategies,
        test_addr(),
    )
    .await
    .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn path_and_query_pass_through_minus_algorithm() {
    init_tracing();
    let (addr, _shutdown) = start_echo_uri_backend().await;

    let config = test_config(&[("s1", addr, 1)]);
    let (registry, strategies) = test_pool(&config);

    let resp = handle_request(
        get_request(
            "http://lb.local/api/users?algorithm=leastConnections&page=2&sort=name",
            &[],
        ),
        test_client(),
        config,
        registry,
        strategies,
        test_addr(),
    )
    .await
    .unwrap();

    let body = collect_body(resp.into_body()).await;
    assert_eq!(body, "/api/users?page=2&sort=name");
}

#[tokio::test]
async fn forwarded_for_is_appended_on_outbound_request() {
    init_tracing();
    let (addr, _shutdown) = start_echo_headers_backend().await;

    let config = test_config(&[("s1", addr, 1)]);
    let (registry, strategies) = test_pool(&config);

    let resp = handle_request(
        get_request("http://lb.local/whoami", &[("x-forwarded-for", "203.0.113.7")]),
        test_client(),
        config,
        registry,
        strategies,
        test_addr(),
    )
    .await
    .unwrap();

    let body = collect_body(resp.into_body()).await;
    let echoed = String::from_utf8_lossy(&body).to_string();
    assert!(
        echoed.contains("x-forwarded-for: 203.0.113.7, 192.168.1.100"),
        "headers seen by backend:\n{echoed}"
    );
}

#[tokio::test]
async fn health_probe_flips_flags_both_ways() {
    init_tracing();
    let (addr, shutdown) = start_backend(StatusCode::OK, "ok").await;

    let config = test_config(&[("s1", addr, 1)]);
    let (registry, _strategies) = test_pool(&config);
    let backend = registry.get("s1").unwrap();

    assert!(probe_backend(&test_client(), &backend, Duration::from_secs(3)).await);
    assert!(backend.is_healthy());

    // Stop the backend; the next probe must mark it unhealthy. A fresh
    // client avoids reusing the pooled keep-alive connection.
    drop(shutdown);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!probe_backend(&test_client(), &backend, Duration::from_secs(1)).await);
    assert!(!backend.is_healthy());
}

#[tokio::test]
async fn failed_probe_of_error_status_marks_unhealthy() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::SERVICE_UNAVAILABLE, "overloaded").await;

    let config = test_config(&[("s1", addr, 1)]);
    let (registry, _strategies) = test_pool(&config);
    let backend = registry.get("s1").unwrap();

    assert!(!probe_backend(&test_client(), &backend, Duration::from_secs(3)).await);
    assert!(!backend.is_healthy());
}

#[tokio::test]
async fn successful_probe_records_latency() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "ok").await;

    let config = test_config(&[("s1", addr, 1)]);
    let (registry, _strategies) = test_pool(&config);
    let backend = registry.get("s1").unwrap();

    assert!(backend.average_latency().is_infinite());
    probe_backend(&test_client(), &backend, Duration::from_secs(3)).await;
    assert!(backend.average_latency().is_finite());
}
