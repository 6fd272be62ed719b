//! A multi-algorithm HTTP reverse-proxy load balancer built on [hyper]
//! and [tokio].
//!
//! This crate provides the balancing core: a registry of backends with
//! copy-on-write healthy snapshots, six pluggable selection strategies
//! (round robin, weighted round robin, least connections, least response
//! time, IP hash, and consistent hashing), a dispatch pipeline that
//! selects, forwards, and records the outcome of every request, a
//! periodic health supervisor, and a metrics facade fed on every
//! dispatch. Structured observability comes via [tracing]; every inbound
//! request carries a monotonic request ID in a [`tracing::Span`].
//!
//! [hyper]: https://hyper.rs/
//! [tokio]: https://tokio.rs/
//! [tracing]: https://docs.rs/tracing

pub mod backend;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod strategy;

pub use backend::Backend;
pub use config::{BackendConfig, Config, RuntimeConfig, ValidatedBackend};
pub use error::BalancerError;
pub use health::{probe_backend, spawn_health_supervisor};
pub use proxy::{HttpClient, build_client, handle_request};
pub use registry::Registry;
pub use strategy::{Algorithm, Strategy, StrategySet};

pub type Result<T> = std::result::Result<T, BalancerError>;
