//! Round-robin selection: a single atomic counter, modulo the pool size.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::backend::Backend;
use crate::strategy::Strategy;
use crate::{BalancerError, Result};

/// Cycles through the healthy snapshot in order.
///
/// The counter is monotonic and may drift far past the pool size; the
/// modulo keeps the index bounded, and wrapping overflow is harmless for
/// the same reason.
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Current raw counter value.
    #[cfg(test)]
    pub fn current_index(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for RoundRobin {
    fn name(&self) -> &'static str {
        "roundRobin"
    }

    fn select(&self, healthy: &[Arc<Backend>], _client_info: &str) -> Result<Arc<Backend>> {
        if healthy.is_empty() {
            return Err(BalancerError::NoHealthyBackend);
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        let selected = Arc::clone(&healthy[index]);
        selected.increment_connections();

        debug!(backend = selected.id(), index, "round robin selection");
        Ok(selected)
    }
}
