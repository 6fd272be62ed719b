//! Weighted round-robin selection over a pre-expanded slot list.
//!
//! Each healthy backend is repeated `weight` times in an immutable
//! expansion list (e.g. weights `[3, 1]` expand to `[A, A, A, B]`), and
//! selection is a single atomic index increment modulo the list length.
//! The expansion is published through an [`ArcSwap`] so readers never
//! take a lock: a rebuild swaps in a fresh list while in-flight
//! selections keep using the one they already loaded.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::strategy::Strategy;
use crate::{BalancerError, Result};

pub struct WeightedRoundRobin {
    expansion: ArcSwap<Vec<Arc<Backend>>>,
    index: AtomicUsize,
    /// Serializes rebuilds with each other; never held by readers.
    rebuild_lock: Mutex<()>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            expansion: ArcSwap::from_pointee(Vec::new()),
            index: AtomicUsize::new(0),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// Length of the current expansion list, `Σ max(1, weight)` over the
    /// healthy backends it was built from.
    pub fn expansion_len(&self) -> usize {
        self.expansion.load().len()
    }

    /// True when the distinct backends in the expansion no longer match
    /// the healthy snapshot (by id).
    fn needs_rebuild(&self, healthy: &[Arc<Backend>]) -> bool {
        let expansion = self.expansion.load();
        if expansion.is_empty() {
            return true;
        }

        let in_expansion: HashSet<&str> = expansion.iter().map(|b| b.id()).collect();
        let in_snapshot: HashSet<&str> = healthy.iter().map(|b| b.id()).collect();
        in_expansion != in_snapshot
    }

    /// Rebuilds the expansion from the healthy snapshot and resets the
    /// index. Double-checks under the lock so concurrent selectors that
    /// both observed a stale expansion rebuild only once.
    fn rebuild(&self, healthy: &[Arc<Backend>]) {
        let _guard = self.rebuild_lock.lock().expect("rebuild lock poisoned");
        if !self.needs_rebuild(healthy) {
            return;
        }

        let expansion: Vec<Arc<Backend>> = healthy
            .iter()
            .flat_map(|backend| {
                std::iter::repeat_with(|| Arc::clone(backend))
                    .take(backend.weight().max(1) as usize)
            })
            .collect();

        info!(
            slots = expansion.len(),
            backends = healthy.len(),
            "rebuilt weighted expansion list"
        );

        self.index.store(0, Ordering::Relaxed);
        self.expansion.store(Arc::new(expansion));
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "weightedRoundRobin"
    }

    fn select(&self, healthy: &[Arc<Backend>], _client_info: &str) -> Result<Arc<Backend>> {
        if healthy.is_empty() {
            return Err(BalancerError::NoHealthyBackend);
        }

        if self.needs_rebuild(healthy) {
            self.rebuild(healthy);
        }

        let expansion = self.expansion.load();
        if expansion.is_empty() {
            return Err(BalancerError::NoHealthyBackend);
        }

        let index = self.index.fetch_add(1, Ordering::Relaxed) % expansion.len();
        let selected = Arc::clone(&expansion[index]);
        selected.increment_connections();

        debug!(backend = selected.id(), slot = index, "weighted selection");
        Ok(selected)
    }

    fn on_init(&self, backends: &[Arc<Backend>]) {
        let healthy: Vec<Arc<Backend>> = backends
            .iter()
            .filter(|b| b.is_healthy())
            .cloned()
            .collect();
        if !healthy.is_empty() {
            self.rebuild(&healthy);
        }
    }
}
