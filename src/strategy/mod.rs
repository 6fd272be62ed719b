//! Backend selection strategies.
//!
//! A [`Strategy`] turns a healthy-backend snapshot plus client identity
//! into a single chosen backend, and later absorbs the outcome of the
//! dispatch. Six concrete algorithms are provided; [`StrategySet`] owns
//! one instance of each and resolves the wire-level algorithm name used
//! in requests and configuration.

use std::str::FromStr;
use std::sync::Arc;

use crate::backend::Backend;
use crate::{BalancerError, Result};

mod consistent_hash;
mod ip_hash;
mod least_connections;
mod least_response_time;
mod round_robin;
mod weighted;

pub use consistent_hash::ConsistentHashing;
pub use ip_hash::IpHash;
pub use least_connections::LeastConnections;
pub use least_response_time::LeastResponseTime;
pub use round_robin::RoundRobin;
pub use weighted::WeightedRoundRobin;

/// A backend selection algorithm.
///
/// Implementations must be safe for concurrent use: many in-flight
/// requests call [`select`](Strategy::select) and
/// [`record`](Strategy::record) simultaneously.
pub trait Strategy: Send + Sync {
    /// The wire-level algorithm name.
    fn name(&self) -> &'static str;

    /// Selects one backend from the healthy snapshot.
    ///
    /// `healthy` must contain only currently-healthy backends; an empty
    /// snapshot fails with [`BalancerError::NoHealthyBackend`]. On
    /// success the chosen backend's connection count has been
    /// incremented before this returns.
    fn select(&self, healthy: &[Arc<Backend>], client_info: &str) -> Result<Arc<Backend>>;

    /// Reports the outcome of a dispatch to the backend chosen by
    /// [`select`](Strategy::select).
    ///
    /// Always releases the connection claimed at selection time; on
    /// success the observed latency is added to the backend's window.
    /// Called exactly once per successful `select`, on every exit path.
    fn record(&self, backend: &Backend, latency_ms: u64, success: bool) {
        backend.decrement_connections();
        if success {
            backend.record_latency(latency_ms);
        }
    }

    /// Called once with the initial backend set, before any `select`.
    fn on_init(&self, _backends: &[Arc<Backend>]) {}

    /// Called after a backend has been added to the registry.
    fn on_add(&self, _backend: &Arc<Backend>) {}

    /// Called after a backend has been removed from the registry.
    fn on_remove(&self, _backend: &Arc<Backend>) {}
}

/// The six wire-level algorithm names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
    IpHash,
    ConsistentHashing,
}

impl Algorithm {
    /// All algorithms, in wire-name order.
    pub const ALL: [Algorithm; 6] = [
        Algorithm::RoundRobin,
        Algorithm::WeightedRoundRobin,
        Algorithm::LeastConnections,
        Algorithm::LeastResponseTime,
        Algorithm::IpHash,
        Algorithm::ConsistentHashing,
    ];

    /// Returns the wire-level name, as used in the `algorithm` query
    /// parameter and the configuration file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "roundRobin",
            Algorithm::WeightedRoundRobin => "weightedRoundRobin",
            Algorithm::LeastConnections => "leastConnections",
            Algorithm::LeastResponseTime => "leastResponseTime",
            Algorithm::IpHash => "ipHash",
            Algorithm::ConsistentHashing => "consistentHashing",
        }
    }
}

impl FromStr for Algorithm {
    type Err = BalancerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "roundRobin" => Ok(Algorithm::RoundRobin),
            "weightedRoundRobin" => Ok(Algorithm::WeightedRoundRobin),
            "leastConnections" => Ok(Algorithm::LeastConnections),
            "leastResponseTime" => Ok(Algorithm::LeastResponseTime),
            "ipHash" => Ok(Algorithm::IpHash),
            "consistentHashing" => Ok(Algorithm::ConsistentHashing),
            other => Err(BalancerError::UnknownAlgorithm(other.to_string())),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instance of every strategy, resolvable by [`Algorithm`].
pub struct StrategySet {
    round_robin: Arc<dyn Strategy>,
    weighted_round_robin: Arc<dyn Strategy>,
    least_connections: Arc<dyn Strategy>,
    least_response_time: Arc<dyn Strategy>,
    ip_hash: Arc<dyn Strategy>,
    consistent_hashing: Arc<dyn Strategy>,
}

impl StrategySet {
    /// Builds all six strategies with the given tuning parameters.
    pub fn new(ewma_alpha: f64, virtual_nodes: usize) -> Self {
        Self {
            round_robin: Arc::new(RoundRobin::new()),
            weighted_round_robin: Arc::new(WeightedRoundRobin::new()),
            least_connections: Arc::new(LeastConnections::new()),
            least_response_time: Arc::new(LeastResponseTime::new(ewma_alpha)),
            ip_hash: Arc::new(IpHash::new()),
            consistent_hashing: Arc::new(ConsistentHashing::new(virtual_nodes)),
        }
    }

    /// Resolves an algorithm to its strategy instance.
    pub fn get(&self, algorithm: Algorithm) -> &Arc<dyn Strategy> {
        match algorithm {
            Algorithm::RoundRobin => &self.round_robin,
            Algorithm::WeightedRoundRobin => &self.weighted_round_robin,
            Algorithm::LeastConnections => &self.least_connections,
            Algorithm::LeastResponseTime => &self.least_response_time,
            Algorithm::IpHash => &self.ip_hash,
            Algorithm::ConsistentHashing => &self.consistent_hashing,
        }
    }

    /// Iterates over every strategy instance.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Strategy>> {
        Algorithm::ALL.iter().map(|a| self.get(*a))
    }

    /// Runs every strategy's `on_init` hook with the initial backend set.
    pub fn init_all(&self, backends: &[Arc<Backend>]) {
        for strategy in self.iter() {
            strategy.on_init(backends);
        }
    }
}
