//! Configuration loading, validation, and pre-computed runtime state.
//!
//! The balancer reads its YAML configuration exactly once at startup.
//! Backend URLs are parsed and validated at load time so the dispatch
//! hot path never touches unvalidated input.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::BalancerError;
use crate::strategy::Algorithm;

/// Default health probe period in milliseconds.
pub const DEFAULT_HEALTH_PROBE_INTERVAL_MS: u64 = 5_000;
/// Default application request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
/// Default health probe timeout in milliseconds.
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 3_000;
/// Default number of virtual nodes per backend on the consistent-hash ring.
pub const DEFAULT_VIRTUAL_NODES: usize = 150;
/// Default EWMA smoothing factor (weight of the newest sample).
pub const DEFAULT_EWMA_ALPHA: f64 = 0.3;
/// Default bounded latency window length per backend.
pub const DEFAULT_LATENCY_WINDOW: usize = 10;
/// Default cap on buffered upstream response bodies, in bytes.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 1024 * 1024;
/// Default client-facing listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 8100;

/// A single backend entry as it appears in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Stable identifier, unique across the pool.
    pub id: String,
    /// Absolute base URL (e.g. `"http://localhost:5001"`).
    pub url: String,
    /// Relative weight for weighted selection. Values below 1 are floored to 1.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Raw configuration as deserialized from the YAML file.
///
/// This struct maps directly to the on-disk schema. After loading, it is
/// transformed into a [`RuntimeConfig`] that holds validated backend URIs
/// and millisecond fields converted to [`Duration`]s.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// The backend pool. Required, non-empty.
    pub backends: Vec<BackendConfig>,
    /// Period between health probe rounds, in milliseconds.
    #[serde(default)]
    pub health_probe_interval_ms: Option<u64>,
    /// Timeout for forwarded application requests, in milliseconds.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Timeout for health probes, in milliseconds.
    #[serde(default)]
    pub health_timeout_ms: Option<u64>,
    /// Virtual nodes per backend on the consistent-hash ring.
    #[serde(default)]
    pub virtual_nodes_per_backend: Option<usize>,
    /// EWMA smoothing factor in `(0, 1]`.
    #[serde(default)]
    pub ewma_alpha: Option<f64>,
    /// Bounded latency window length per backend.
    #[serde(default)]
    pub latency_window_size: Option<usize>,
    /// Cap on buffered upstream response bodies, in bytes.
    #[serde(default)]
    pub max_body_size: Option<u64>,
    /// Selection algorithm used when the request does not name one.
    #[serde(default)]
    pub default_algorithm: Option<String>,
    /// Client-facing listen port.
    #[serde(default)]
    pub listen_port: Option<u16>,
}

/// A validated backend entry with its URI parsed.
#[derive(Debug, Clone)]
pub struct ValidatedBackend {
    /// Stable identifier, unique across the pool.
    pub id: String,
    /// Parsed base URI with scheme and authority.
    pub uri: hyper::Uri,
    /// Weight, floored at 1.
    pub weight: u32,
}

/// Fully validated, ready-to-use configuration.
///
/// Created once at startup and shared across all request handlers via `Arc`.
#[derive(Debug)]
pub struct RuntimeConfig {
    /// The validated backend pool.
    pub backends: Vec<ValidatedBackend>,
    /// Period between health probe rounds.
    pub health_probe_interval: Duration,
    /// Timeout for forwarded application requests.
    pub request_timeout: Duration,
    /// Timeout for health probes.
    pub health_timeout: Duration,
    /// Virtual nodes per backend on the consistent-hash ring.
    pub virtual_nodes_per_backend: usize,
    /// EWMA smoothing factor.
    pub ewma_alpha: f64,
    /// Bounded latency window length per backend.
    pub latency_window_size: usize,
    /// Cap on buffered upstream response bodies, in bytes.
    pub max_body_size: u64,
    /// Selection algorithm used when the request does not name one.
    pub default_algorithm: Algorithm,
    /// Client-facing listen port.
    pub listen_port: u16,
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    ///
    /// Returns a [`BalancerError::Config`] if the file cannot be opened or
    /// its contents fail YAML deserialization.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self, BalancerError> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            BalancerError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| BalancerError::Config(format!("failed to parse config: {e}")))
    }

    /// Validates all fields, producing a [`RuntimeConfig`] suitable for
    /// the dispatch hot path.
    ///
    /// Fails if the backend list is empty, any backend id is blank or
    /// duplicated, any URL is malformed or lacks scheme/authority, the
    /// EWMA alpha is outside `(0, 1]`, or the default algorithm name is
    /// unrecognized.
    pub fn into_runtime(self) -> Result<RuntimeConfig, BalancerError> {
        if self.backends.is_empty() {
            return Err(BalancerError::Config(
                "at least one backend must be configured".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        let backends = self
            .backends
            .into_iter()
            .map(|b| {
                if b.id.trim().is_empty() {
                    return Err(BalancerError::InvalidBackend(
                        "backend id must not be empty".into(),
                    ));
                }
                if !seen.insert(b.id.clone()) {
                    return Err(BalancerError::InvalidBackend(format!(
                        "duplicate backend id: {}",
                        b.id
                    )));
                }

                let uri = b.url.parse::<hyper::Uri>().map_err(|e| {
                    BalancerError::InvalidBackend(format!("{}: {e}", b.id))
                })?;
                uri.scheme().ok_or_else(|| {
                    BalancerError::InvalidBackend(format!("{}: URL has no scheme", b.id))
                })?;
                uri.authority().ok_or_else(|| {
                    BalancerError::InvalidBackend(format!("{}: URL has no authority", b.id))
                })?;

                Ok(ValidatedBackend {
                    id: b.id,
                    uri,
                    weight: b.weight.max(1),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let ewma_alpha = self.ewma_alpha.unwrap_or(DEFAULT_EWMA_ALPHA);
        if !(ewma_alpha > 0.0 && ewma_alpha <= 1.0) {
            return Err(BalancerError::Config(format!(
                "ewma_alpha must be in (0, 1], got {ewma_alpha}"
            )));
        }

        let default_algorithm = match self.default_algorithm {
            Some(name) => name
                .parse::<Algorithm>()
                .map_err(|_| BalancerError::Config(format!("unknown default_algorithm: {name}")))?,
            None => Algorithm::RoundRobin,
        };

        Ok(RuntimeConfig {
            backends,
            health_probe_interval: Duration::from_millis(
                self.health_probe_interval_ms
                    .unwrap_or(DEFAULT_HEALTH_PROBE_INTERVAL_MS),
            ),
            request_timeout: Duration::from_millis(
                self.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            ),
            health_timeout: Duration::from_millis(
                self.health_timeout_ms.unwrap_or(DEFAULT_HEALTH_TIMEOUT_MS),
            ),
            virtual_nodes_per_backend: self
                .virtual_nodes_per_backend
                .unwrap_or(DEFAULT_VIRTUAL_NODES),
            ewma_alpha,
            latency_window_size: self.latency_window_size.unwrap_or(DEFAULT_LATENCY_WINDOW),
            max_body_size: self.max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE),
            default_algorithm,
            listen_port: self.listen_port.unwrap_or(DEFAULT_LISTEN_PORT),
        })
    }
}
