//! Least-connections selection with lock-free claim.
//!
//! Scanning for the minimum and incrementing its counter are two steps;
//! without coordination two selectors can both observe the same minimum
//! and pile onto one backend. The claim is therefore a compare-and-set
//! on the observed count: if another selector raced past, the CAS fails
//! and the scan repeats against fresh counts. The retry loop is bounded;
//! after that a plain increment on the current argmin trades strict
//! minimality for progress.

use std::sync::Arc;

use tracing::debug;

use crate::backend::Backend;
use crate::strategy::Strategy;
use crate::{BalancerError, Result};

const MAX_RETRIES: usize = 3;

pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }

    /// The backend currently minimizing `(current_connections, id)`.
    fn argmin<'a>(healthy: &'a [Arc<Backend>]) -> &'a Arc<Backend> {
        healthy
            .iter()
            .min_by_key(|b| (b.current_connections(), b.id()))
            .expect("argmin requires a non-empty snapshot")
    }

    /// The least-loaded healthy backend, without claiming it.
    pub fn least_loaded<'a>(healthy: &'a [Arc<Backend>]) -> Option<&'a Arc<Backend>> {
        healthy.iter().min_by_key(|b| b.current_connections())
    }
}

impl Default for LeastConnections {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for LeastConnections {
    fn name(&self) -> &'static str {
        "leastConnections"
    }

    fn select(&self, healthy: &[Arc<Backend>], _client_info: &str) -> Result<Arc<Backend>> {
        if healthy.is_empty() {
            return Err(BalancerError::NoHealthyBackend);
        }

        for retry in 0..MAX_RETRIES {
            let min = Self::argmin(healthy);
            let connections = min.current_connections();

            if min.try_increment_connections(connections) {
                debug!(
                    backend = min.id(),
                    connections = connections + 1,
                    "least connections selection"
                );
                return Ok(Arc::clone(min));
            }

            debug!(retry = retry + 1, max = MAX_RETRIES, "selection CAS lost, rescanning");
        }

        // Contention exhausted the retries; claim the current argmin
        // unconditionally so selection always completes.
        let fallback = Self::least_loaded(healthy).expect("non-empty snapshot");
        fallback.increment_connections();
        debug!(backend = fallback.id(), "least connections fallback selection");

        Ok(Arc::clone(fallback))
    }
}
