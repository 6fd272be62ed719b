//! Backend registry: owns the pool and publishes healthy snapshots.
//!
//! The backend list is held behind an [`ArcSwap`] so snapshot
//! construction never blocks on writers: `add` and `remove` clone the
//! list, mutate the clone, and swap it in, while concurrent readers keep
//! iterating the list they already loaded. Structural changes fan out to
//! subscribed strategies synchronously, after the new list is visible.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::info;

use crate::backend::Backend;
use crate::config::ValidatedBackend;
use crate::strategy::Strategy;

pub struct Registry {
    backends: ArcSwap<Vec<Arc<Backend>>>,
    /// Serializes structural writers; readers never take it.
    writer_lock: Mutex<()>,
    subscribers: Mutex<Vec<Arc<dyn Strategy>>>,
    latency_window: usize,
}

impl Registry {
    /// Builds a registry from validated configuration entries, all
    /// initially healthy.
    pub fn from_validated(validated: &[ValidatedBackend], latency_window: usize) -> Self {
        let backends: Vec<Arc<Backend>> = validated
            .iter()
            .map(|config| Arc::new(Backend::new(config, latency_window)))
            .collect();

        for backend in &backends {
            crate::metrics::update_backend_health(backend.id(), true);
        }

        Self {
            backends: ArcSwap::from_pointee(backends),
            writer_lock: Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
            latency_window,
        }
    }

    /// Registers a strategy for `on_add` / `on_remove` lifecycle events.
    pub fn subscribe(&self, strategy: Arc<dyn Strategy>) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(strategy);
    }

    /// Returns the full backend list (healthy and unhealthy).
    pub fn all(&self) -> Arc<Vec<Arc<Backend>>> {
        self.backends.load_full()
    }

    /// Captures an immutable snapshot of the currently-healthy backends,
    /// in registration order.
    pub fn healthy_snapshot(&self) -> Vec<Arc<Backend>> {
        self.backends
            .load()
            .iter()
            .filter(|b| b.is_healthy())
            .cloned()
            .collect()
    }

    /// Looks up a backend by id.
    pub fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.backends.load().iter().find(|b| b.id() == id).cloned()
    }

    /// Registers a new backend and notifies subscribed strategies.
    pub fn add(&self, config: &ValidatedBackend) -> Arc<Backend> {
        let backend = Arc::new(Backend::new(config, self.latency_window));

        {
            let _guard = self.writer_lock.lock().expect("writer lock poisoned");
            let mut next = Vec::clone(&self.backends.load());
            next.push(Arc::clone(&backend));
            self.backends.store(Arc::new(next));
        }

        crate::metrics::update_backend_health(backend.id(), true);
        info!(backend = backend.id(), url = %backend.uri(), "backend registered");

        for strategy in self.subscribers.lock().expect("subscriber lock poisoned").iter() {
            strategy.on_add(&backend);
        }
        backend
    }

    /// Removes a backend by id and notifies subscribed strategies.
    /// Returns the removed record, which stays valid for requests still
    /// in flight against it.
    pub fn remove(&self, id: &str) -> Option<Arc<Backend>> {
        let removed = {
            let _guard = self.writer_lock.lock().expect("writer lock poisoned");
            let current = self.backends.load();
            let removed = current.iter().find(|b| b.id() == id).cloned()?;
            let next: Vec<Arc<Backend>> = current
                .iter()
                .filter(|b| b.id() != id)
                .cloned()
                .collect();
            self.backends.store(Arc::new(next));
            removed
        };

        info!(backend = id, "backend removed");
        for strategy in self.subscribers.lock().expect("subscriber lock poisoned").iter() {
            strategy.on_remove(&removed);
        }
        Some(removed)
    }

    /// Updates a backend's health flag by id.
    pub fn set_healthy(&self, id: &str, healthy: bool) {
        if let Some(backend) = self.get(id) {
            backend.set_healthy(healthy);
        }
    }
}
