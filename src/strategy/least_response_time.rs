//! Least-response-time selection: exponentially-weighted response-time
//! statistics per backend, argmin with failure penalty.
//!
//! Each backend's score blends two signals: the arithmetic mean of its
//! recent-latency window (kept on the backend record) and an EWMA kept
//! here. Backends with no data score at the 1000 ms bootstrap value.
//! Failures feed the EWMA a synthetic 2000 ms sample so a backend that
//! times out drifts out of favor even if it was fast before failing.
//!
//! A consistently fastest backend will absorb essentially all traffic:
//! selection is a pure argmin with no exploration. That concentration is
//! an accepted property of the algorithm, not an accident.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::backend::Backend;
use crate::strategy::Strategy;
use crate::{BalancerError, Result};

/// Score assigned to a backend before any observation.
const INITIAL_RESPONSE_TIME_MS: f64 = 1000.0;

/// Per-backend EWMA state.
#[derive(Debug, Clone)]
pub struct EwmaStats {
    avg: f64,
    count: u64,
    initialized: bool,
}

impl Default for EwmaStats {
    fn default() -> Self {
        Self {
            avg: INITIAL_RESPONSE_TIME_MS,
            count: 0,
            initialized: false,
        }
    }
}

impl EwmaStats {
    /// Folds a new sample into the average. The first real sample
    /// replaces the bootstrap value outright; later samples blend with
    /// weight `alpha`.
    fn update(&mut self, sample_ms: f64, alpha: f64) {
        if self.initialized {
            self.avg = alpha * sample_ms + (1.0 - alpha) * self.avg;
        } else {
            self.avg = sample_ms;
            self.initialized = true;
        }
        self.count += 1;
    }

    pub fn average(&self) -> f64 {
        self.avg
    }

    pub fn sample_count(&self) -> u64 {
        self.count
    }
}

pub struct LeastResponseTime {
    stats: DashMap<String, EwmaStats>,
    alpha: f64,
}

impl LeastResponseTime {
    pub fn new(alpha: f64) -> Self {
        Self {
            stats: DashMap::new(),
            alpha,
        }
    }

    fn update_ewma(&self, backend_id: &str, sample_ms: f64) {
        self.stats
            .entry(backend_id.to_string())
            .or_default()
            .update(sample_ms, self.alpha);
    }

    /// The score used for argmin selection: the mean of the window
    /// average and the EWMA when both are available, otherwise whichever
    /// exists, otherwise the bootstrap value.
    pub fn effective_response_time(&self, backend: &Backend) -> f64 {
        let window_avg = backend.average_latency();
        let ewma = self.stats.get(backend.id()).map(|s| s.avg);

        match (window_avg.is_finite(), ewma) {
            (true, Some(ewma)) => (window_avg + ewma) / 2.0,
            (true, None) => window_avg,
            (false, Some(ewma)) => ewma,
            (false, None) => INITIAL_RESPONSE_TIME_MS,
        }
    }

    /// Current EWMA for a backend id, if tracked.
    pub fn ewma(&self, backend_id: &str) -> Option<f64> {
        self.stats.get(backend_id).map(|s| s.avg)
    }
}

impl Strategy for LeastResponseTime {
    fn name(&self) -> &'static str {
        "leastResponseTime"
    }

    fn select(&self, healthy: &[Arc<Backend>], _client_info: &str) -> Result<Arc<Backend>> {
        if healthy.is_empty() {
            return Err(BalancerError::NoHealthyBackend);
        }

        let mut scored: Vec<(f64, &Arc<Backend>)> = healthy
            .iter()
            .map(|b| (self.effective_response_time(b), b))
            .collect();
        scored.sort_by(|(ta, a), (tb, b)| {
            ta.partial_cmp(tb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id().cmp(b.id()))
        });

        let (score, selected) = scored[0];
        let selected = Arc::clone(selected);
        selected.increment_connections();

        debug!(
            backend = selected.id(),
            effective_ms = score,
            "least response time selection"
        );
        Ok(selected)
    }

    fn record(&self, backend: &Backend, latency_ms: u64, success: bool) {
        backend.decrement_connections();

        if success {
            backend.record_latency(latency_ms);
            self.update_ewma(backend.id(), latency_ms as f64);
        } else {
            // Penalty sample: twice the bootstrap value.
            self.update_ewma(backend.id(), INITIAL_RESPONSE_TIME_MS * 2.0);
        }
    }

    fn on_init(&self, backends: &[Arc<Backend>]) {
        for backend in backends.iter().filter(|b| b.is_healthy()) {
            self.stats
                .entry(backend.id().to_string())
                .or_default();
        }
    }

    fn on_add(&self, backend: &Arc<Backend>) {
        if backend.is_healthy() {
            self.stats
                .entry(backend.id().to_string())
                .or_default();
        }
    }

    fn on_remove(&self, backend: &Arc<Backend>) {
        self.stats.remove(backend.id());
    }
}
