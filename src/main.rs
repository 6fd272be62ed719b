use std::net::SocketAddr;
use std::sync::Arc;

use switchyard::server::{ServerState, serve, shutdown_signal};
use switchyard::{Config, Registry, StrategySet, build_client, metrics, spawn_health_supervisor};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE_PATH: &str = "./Config.yml";
const METRICS_PORT: u16 = 9100;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::load_from_file(CONFIG_FILE_PATH)
        .and_then(|c| c.into_runtime())
        .unwrap_or_else(|e| {
            error!(%e, "failed to load configuration");
            std::process::exit(1);
        });

    info!(
        backends = config.backends.len(),
        default_algorithm = %config.default_algorithm,
        request_timeout = ?config.request_timeout,
        health_probe_interval = ?config.health_probe_interval,
        health_timeout = ?config.health_timeout,
        virtual_nodes = config.virtual_nodes_per_backend,
        ewma_alpha = config.ewma_alpha,
        "configuration loaded"
    );

    metrics::init(SocketAddr::from(([127, 0, 0, 1], METRICS_PORT)));

    let config = Arc::new(config);
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

    let supervisor = spawn_health_supervisor(
        Arc::clone(&registry),
        config.health_probe_interval,
        config.health_timeout,
    );

    let client = build_client();
    let addr = SocketAddr::from(([127, 0, 0, 1], config.listen_port));

    let listener = TcpListener::bind(addr).await.unwrap_or_else(|e| {
        error!(%e, %addr, "failed to bind");
        std::process::exit(1);
    });

    info!(%addr, "listening");

    serve(
        listener,
        client,
        ServerState {
            config,
            registry,
            strategies,
        },
        shutdown_signal(),
    )
    .await;

    supervisor.abort();
    info!("shutdown complete");
}
