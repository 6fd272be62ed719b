//! Server accept loop and graceful shutdown.
//!
//! Contains the runtime infrastructure that sits between the TCP
//! listener and the per-request dispatch pipeline. This module is
//! decoupled from `main()` so the server logic stays testable without
//! process-level concerns like signal handling or `std::process::exit`.

use std::future::Future;
use std::sync::Arc;

use hyper::Response;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::proxy::{HttpClient, handle_request};
use crate::registry::Registry;
use crate::strategy::StrategySet;

/// Runtime state shared across the accept loop.
pub struct ServerState {
    /// Validated configuration shared by all handlers.
    pub config: Arc<RuntimeConfig>,
    /// The backend pool.
    pub registry: Arc<Registry>,
    /// One instance of every selection strategy.
    pub strategies: Arc<StrategySet>,
}

/// Accepts connections on `listener` and dispatches them through the
/// proxy pipeline using the given `client` and shared `state`.
///
/// Runs until `shutdown` resolves, then stops accepting new connections
/// and returns. In-flight requests on already-spawned tasks continue to
/// completion independently.
pub async fn serve(
    listener: TcpListener,
    client: HttpClient,
    state: ServerState,
    shutdown: impl Future<Output = ()>,
) {
    let ServerState {
        config,
        registry,
        strategies,
    } = state;

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let client = client.clone();
                let config = Arc::clone(&config);
                let registry = Arc::clone(&registry);
                let strategies = Arc::clone(&strategies);

                tokio::spawn(async move {
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let client = client.clone();
                        let config = Arc::clone(&config);
                        let registry = Arc::clone(&registry);
                        let strategies = Arc::clone(&strategies);
                        async move {
                            let resp = handle_request(
                                req,
                                client,
                                config,
                                registry,
                                strategies,
                                client_addr,
                            )
                            .await
                            .unwrap_or_else(|e| e.into_response());
                            Ok::<Response<_>, std::convert::Infallible>(resp)
                        }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await
                    {
                        warn!(%e, "connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}
