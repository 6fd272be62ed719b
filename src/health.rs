//! Periodic backend health supervision.
//!
//! A background task probes every registered backend at a fixed period
//! with `GET {url}/health`. A 2xx response within the probe timeout
//! marks the backend healthy and records the probe latency; anything
//! else marks it unhealthy. Strategies observe the flag change lazily on
//! their next selection, so no rebuild happens here.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::backend::Backend;
use crate::metrics;
use crate::proxy::HttpClient;
use crate::registry::Registry;

/// Path probed on every backend.
const HEALTH_PATH: &str = "/health";

/// Spawns the supervisor task. Probes run sequentially within a round;
/// the ticker delays rather than bursts if a round overruns the period.
pub fn spawn_health_supervisor(
    registry: Arc<Registry>,
    interval: Duration,
    probe_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    let client: HttpClient =
        hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build(hyper_util::client::legacy::connect::HttpConnector::new());

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            for backend in registry.all().iter() {
                probe_backend(&client, backend, probe_timeout).await;
            }
        }
    })
}

/// Probes one backend and updates its health flag. Returns the new
/// health state.
pub async fn probe_backend(
    client: &HttpClient,
    backend: &Arc<Backend>,
    probe_timeout: Duration,
) -> bool {
    let uri_str = format!(
        "{}://{}{HEALTH_PATH}",
        backend.uri().scheme_str().unwrap_or("http"),
        backend
            .uri()
            .authority()
            .map(|a| a.as_str())
            .unwrap_or("localhost"),
    );

    let uri = match uri_str.parse::<hyper::Uri>() {
        Ok(u) => u,
        Err(e) => {
            warn!(backend = backend.id(), error = %e, "failed to build health probe URI");
            mark(backend, false);
            return false;
        }
    };

    let start = std::time::Instant::now();
    let result = tokio::time::timeout(probe_timeout, client.get(uri)).await;

    match result {
        Ok(Ok(resp)) if resp.status().is_success() => {
            let probe_ms = start.elapsed().as_millis() as u64;
            let was_unhealthy = !backend.is_healthy();

            backend.record_latency(probe_ms);
            mark(backend, true);

            if was_unhealthy {
                info!(backend = backend.id(), probe_ms, "health probe passed, backend recovered");
            }
            true
        }
        Ok(Ok(resp)) => {
            warn!(
                backend = backend.id(),
                status = resp.status().as_u16(),
                "health probe returned non-success status"
            );
            mark(backend, false);
            false
        }
        Ok(Err(e)) => {
            warn!(backend = backend.id(), error = %e, "health probe failed");
            mark(backend, false);
            false
        }
        Err(_) => {
            warn!(backend = backend.id(), timeout = ?probe_timeout, "health probe timed out");
            mark(backend, false);
            false
        }
    }
}

fn mark(backend: &Arc<Backend>, healthy: bool) {
    backend.set_healthy(healthy);
    metrics::update_backend_health(backend.id(), healthy);
}
