//! Request dispatcher: select a backend, forward, record the outcome.
//!
//! Every inbound request is assigned a monotonically increasing request
//! ID and wrapped in a [`tracing::Span`] carrying structured fields for
//! observability.
//!
//! The pipeline performs the following steps in order:
//!
//! 1. **Algorithm resolution** — The `algorithm` query parameter picks
//!    one of the six strategies; unknown names receive 400, absence
//!    falls back to the configured default.
//! 2. **Snapshot** — The registry's healthy snapshot is captured once;
//!    an empty snapshot short-circuits with 503.
//! 3. **Client identity** — Taken from the leftmost `X-Forwarded-For`
//!    entry, then `X-Real-IP`, then the peer address.
//! 4. **Selection** — The strategy picks a backend and claims a
//!    connection on it.
//! 5. **Forwarding** — A GET to the backend with the original path and
//!    query (minus the internal `algorithm` parameter), bounded by the
//!    request timeout, response body capped.
//! 6. **Recording** — `strategy.record` runs exactly once for the
//!    selected backend on every exit path, success or failure. This is
//!    the invariant that keeps connection counts accurate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, StatusCode, Uri};
use tokio::time::timeout;
use tracing::{Instrument, debug, info, warn};

use crate::backend::Backend;
use crate::config::RuntimeConfig;
use crate::registry::Registry;
use crate::strategy::{Algorithm, StrategySet};
use crate::{BalancerError, Result, metrics};

/// The HTTP client type used for backend connections.
pub type HttpClient = hyper_util::client::legacy::Client<
    hyper_util::client::legacy::connect::HttpConnector,
    Empty<Bytes>,
>;

/// Builds the shared backend HTTP client.
pub fn build_client() -> HttpClient {
    hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(hyper_util::client::legacy::connect::HttpConnector::new())
}

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Processes a single inbound request through the dispatch pipeline.
///
/// Generic over the inbound body type, which is never read: only GET
/// requests are forwarded and the outbound request carries no body.
pub async fn handle_request<B>(
    req: Request<B>,
    client: HttpClient,
    config: Arc<RuntimeConfig>,
    registry: Arc<Registry>,
    strategies: Arc<StrategySet>,
    client_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>> {
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let method = req.method().clone();
    let uri = req.uri().clone();

    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %method,
        uri = %uri,
        client = %client_addr,
    );

    async move {
        if method != Method::GET {
            debug!("rejecting non-GET request");
            return Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from_static(
                    b"only GET requests are supported",
                )))?);
        }

        let algorithm = match query_param(&uri, "algorithm") {
            Some(name) => name.parse::<Algorithm>()?,
            None => config.default_algorithm,
        };
        let strategy = strategies.get(algorithm);

        let healthy = registry.healthy_snapshot();
        if healthy.is_empty() {
            warn!("no healthy backend available");
            metrics::record_error(algorithm.as_str(), "none", "no_healthy_backend");
            return Err(BalancerError::NoHealthyBackend);
        }

        let client_info = extract_client_info(req.headers(), client_addr);
        let backend = strategy.select(&healthy, &client_info)?;

        metrics::record_selection(algorithm.as_str(), backend.id());
        metrics::update_active_connections(backend.id(), backend.current_connections());

        info!(
            backend = backend.id(),
            algorithm = algorithm.as_str(),
            client = %client_info,
            "forwarding request"
        );

        let start = std::time::Instant::now();
        let outcome = forward(&client, &config, &backend, &uri, req.headers(), client_addr).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        let success = outcome.is_ok();

        // The one record call matching the select above; it releases the
        // claimed connection on every path.
        strategy.record(&backend, elapsed_ms, success);

        metrics::record_request(algorithm.as_str(), backend.id(), success);
        metrics::record_response_time(algorithm.as_str(), backend.id(), elapsed_ms);
        metrics::update_active_connections(backend.id(), backend.current_connections());

        match &outcome {
            Ok(resp) => info!(
                status = resp.status().as_u16(),
                latency_ms = elapsed_ms,
                "backend responded"
            ),
            Err(e) => {
                warn!(error = %e, latency_ms = elapsed_ms, "backend request failed");
                metrics::record_error(algorithm.as_str(), backend.id(), e.kind());
            }
        }

        outcome
    }
    .instrument(span)
    .await
}

/// Issues the backend GET and converts the response, bounded by the
/// request timeout and the body size cap.
async fn forward(
    client: &HttpClient,
    config: &RuntimeConfig,
    backend: &Backend,
    original_uri: &Uri,
    inbound_headers: &HeaderMap,
    client_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>> {
    let target = rewrite_uri(backend, original_uri)?;

    let client_ip = client_addr.ip().to_string();
    let xff = inbound_headers
        .get("x-forwarded-for")
        .and_then(|existing| existing.to_str().ok())
        .map(|existing| format!("{existing}, {client_ip}"))
        .unwrap_or(client_ip);

    let proxy_req = Request::builder()
        .method(Method::GET)
        .uri(target)
        .header("x-forwarded-for", xff)
        .body(Empty::<Bytes>::new())?;

    let max_body = config.max_body_size as usize;
    let result = timeout(config.request_timeout, async {
        let resp = client
            .request(proxy_req)
            .await
            .map_err(|e| BalancerError::Upstream(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BalancerError::Upstream(format!(
                "backend returned {status}"
            )));
        }

        let (parts, body) = resp.into_parts();
        let bytes = Limited::new(body, max_body)
            .collect()
            .await
            .map_err(|e| BalancerError::Upstream(format!("failed to read backend body: {e}")))?
            .to_bytes();

        Ok((parts, bytes))
    })
    .await;

    let (mut parts, bytes) = match result {
        Ok(Ok(ok)) => ok,
        Ok(Err(e)) => return Err(e),
        Err(_elapsed) => return Err(BalancerError::Timeout(config.request_timeout)),
    };

    // The body was buffered, so connection-scoped framing headers from
    // the backend no longer apply.
    parts.headers.remove(hyper::header::TRANSFER_ENCODING);
    parts.headers.remove(hyper::header::CONNECTION);

    let mut response = Response::new(Full::new(bytes));
    *response.status_mut() = parts.status;
    *response.headers_mut() = parts.headers;
    *response.version_mut() = parts.version;
    Ok(response)
}

/// Rewrites the original request URI to target the chosen backend,
/// preserving the path and the query string minus the internal
/// `algorithm` parameter.
fn rewrite_uri(backend: &Backend, original: &Uri) -> Result<Uri> {
    let authority = backend
        .uri()
        .authority()
        .ok_or_else(|| BalancerError::InvalidBackend("backend URL has no authority".into()))?;
    let scheme = backend
        .uri()
        .scheme()
        .ok_or_else(|| BalancerError::InvalidBackend("backend URL has no scheme".into()))?;

    let path = original.path();
    let path_and_query = match original.query().map(strip_algorithm_param) {
        Some(query) if !query.is_empty() => format!("{path}?{query}"),
        _ => path.to_string(),
    };

    Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| BalancerError::Internal(format!("failed to build backend URI: {e}")))
}

/// Looks up a single query parameter by name.
fn query_param<'a>(uri: &'a Uri, name: &str) -> Option<&'a str> {
    uri.query()?
        .split('&')
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Drops the `algorithm` parameter from a query string, preserving
/// everything else in order.
fn strip_algorithm_param(query: &str) -> String {
    query
        .split('&')
        .filter(|pair| *pair != "algorithm" && !pair.starts_with("algorithm="))
        .collect::<Vec<_>>()
        .join("&")
}

/// Client identity used for hashing strategies: the leftmost
/// `X-Forwarded-For` entry, then `X-Real-IP`, then the peer address.
fn extract_client_info(headers: &HeaderMap, client_addr: SocketAddr) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }

    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return real_ip.to_string();
    }

    client_addr.ip().to_string()
}
