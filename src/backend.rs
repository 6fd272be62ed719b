//! Per-backend runtime state.
//!
//! Each backend is represented by a [`Backend`] record holding its
//! identity, URI, weight, a health flag, and the live metrics the
//! selection strategies read: an atomic in-flight connection counter, a
//! monotonic total-request counter, and a small bounded window of recent
//! response times.
//!
//! Connection-count updates are sequentially consistent because the
//! least-connections strategy's compare-and-set selection depends on
//! cross-thread visibility of every increment. The latency window is
//! guarded by a per-backend mutex; the window is tiny (10 samples by
//! default) so the critical section is a few loads.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::config::ValidatedBackend;

/// Runtime record for a single backend.
///
/// Equality and hashing are by `id` only: two records with the same id
/// refer to the same backend regardless of live metric state.
#[derive(Debug)]
pub struct Backend {
    id: String,
    uri: hyper::Uri,
    weight: u32,
    healthy: AtomicBool,
    current_connections: AtomicU32,
    total_requests: AtomicU64,
    recent_latencies: Mutex<VecDeque<u64>>,
    latency_window: usize,
}

impl Backend {
    /// Creates a new backend from a validated configuration entry,
    /// initially healthy with zero connections.
    pub fn new(config: &ValidatedBackend, latency_window: usize) -> Self {
        Self {
            id: config.id.clone(),
            uri: config.uri.clone(),
            weight: config.weight.max(1),
            healthy: AtomicBool::new(true),
            current_connections: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            recent_latencies: Mutex::new(VecDeque::with_capacity(latency_window)),
            latency_window,
        }
    }

    /// Returns the stable backend identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the backend base URI.
    pub fn uri(&self) -> &hyper::Uri {
        &self.uri
    }

    /// Returns the load-balancing weight (always ≥ 1).
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Returns `true` if this backend is currently considered healthy.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Sets the health flag.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    /// Atomically increments the in-flight connection count and the
    /// monotonic total-request counter.
    pub fn increment_connections(&self) {
        self.current_connections.fetch_add(1, Ordering::SeqCst);
        self.total_requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Attempts to move the connection count from `expected` to
    /// `expected + 1` in one atomic step. On success the total-request
    /// counter is also incremented.
    ///
    /// This is the primitive the least-connections strategy uses to make
    /// "pick the minimum and claim it" observably atomic: if another
    /// selector won the race, the compare-and-set fails and the caller
    /// re-scans.
    pub fn try_increment_connections(&self, expected: u32) -> bool {
        let won = self
            .current_connections
            .compare_exchange(expected, expected + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            self.total_requests.fetch_add(1, Ordering::SeqCst);
        }
        won
    }

    /// Decrements the in-flight connection count, saturating at 0.
    pub fn decrement_connections(&self) {
        let _ = self
            .current_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
    }

    /// Returns the current in-flight connection count.
    pub fn current_connections(&self) -> u32 {
        self.current_connections.load(Ordering::SeqCst)
    }

    /// Returns the monotonic total-request count.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::SeqCst)
    }

    /// Appends a latency sample to the bounded window, evicting the
    /// oldest sample once the window is full.
    pub fn record_latency(&self, latency_ms: u64) {
        let mut window = self
            .recent_latencies
            .lock()
            .expect("latency window lock poisoned");
        window.push_back(latency_ms);
        while window.len() > self.latency_window {
            window.pop_front();
        }
    }

    /// Returns the arithmetic mean of the latency window, or
    /// [`f64::INFINITY`] when no sample has been recorded yet so that an
    /// unobserved backend sorts last under min-selection.
    pub fn average_latency(&self) -> f64 {
        let window = self
            .recent_latencies
            .lock()
            .expect("latency window lock poisoned");
        if window.is_empty() {
            return f64::INFINITY;
        }
        window.iter().sum::<u64>() as f64 / window.len() as f64
    }
}

impl PartialEq for Backend {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Backend {}

impl Hash for Backend {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
