//! Error types and HTTP status code mapping.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

/// Every failure the balancer can produce, each mapping to a specific HTTP status.
#[derive(Debug)]
pub enum BalancerError {
    /// The configuration file could not be loaded or parsed.
    Config(String),
    /// A configured backend entry is malformed or unparseable.
    InvalidBackend(String),
    /// No backend in the pool is currently healthy.
    NoHealthyBackend,
    /// The client requested an unrecognized selection algorithm.
    UnknownAlgorithm(String),
    /// The backend returned a non-2xx status or was unreachable.
    Upstream(String),
    /// The backend did not respond within the configured timeout.
    Timeout(Duration),
    /// An internal error that does not fit other categories.
    Internal(String),
}

impl fmt::Display for BalancerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidBackend(msg) => write!(f, "invalid backend: {msg}"),
            Self::NoHealthyBackend => write!(f, "no healthy backend available"),
            Self::UnknownAlgorithm(name) => write!(f, "unknown algorithm: {name}"),
            Self::Upstream(msg) => write!(f, "upstream error: {msg}"),
            Self::Timeout(d) => write!(f, "upstream timed out after {d:?}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for BalancerError {}

impl BalancerError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::InvalidBackend(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NoHealthyBackend => StatusCode::SERVICE_UNAVAILABLE,
            Self::UnknownAlgorithm(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) | Self::Timeout(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Converts this error into an HTTP response with a JSON body.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": match &self {
                Self::Config(_) => "config_error",
                Self::InvalidBackend(_) => "invalid_backend",
                Self::NoHealthyBackend => "no_healthy_backend",
                Self::UnknownAlgorithm(_) => "unknown_algorithm",
                Self::Upstream(_) => "upstream_error",
                Self::Timeout(_) => "upstream_timeout",
                Self::Internal(_) => "internal_error",
            },
            "message": self.to_string(),
        });

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap_or_else(|_| {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::new()))
                    .expect("building fallback response must not fail")
            })
    }

    /// A short tag naming the error kind, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::InvalidBackend(_) => "invalid_backend",
            Self::NoHealthyBackend => "no_healthy_backend",
            Self::UnknownAlgorithm(_) => "unknown_algorithm",
            Self::Upstream(_) => "upstream",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<hyper::http::Error> for BalancerError {
    fn from(err: hyper::http::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<hyper::header::InvalidHeaderValue> for BalancerError {
    fn from(err: hyper::header::InvalidHeaderValue) -> Self {
        Self::Internal(err.to_string())
    }
}
