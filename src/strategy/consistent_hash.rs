//! Consistent-hashing selection over an MD5 ring with virtual nodes.
//!
//! Every healthy backend contributes `virtual_nodes` phantom entries to
//! a sorted ring, keyed by the MD5 hash of `"{id}#{index}"`. A client
//! maps to the first ring entry at or clockwise-after its own hash,
//! wrapping to the start of the ring past the end. Virtual nodes smooth
//! the distribution and bound how many clients move when the backend set
//! changes.
//!
//! The ring is immutable once built and published through an
//! [`ArcSwap`]: lookups never lock, and a rebuild (triggered when the
//! ring's backend set drifts from the healthy snapshot) swaps in a fully
//! constructed replacement. A digest is constructed per hash call, so
//! the hash path never serializes on shared state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use md5::{Digest, Md5};
use tracing::{debug, info};

use crate::backend::Backend;
use crate::strategy::Strategy;
use crate::{BalancerError, Result};

pub struct ConsistentHashing {
    ring: ArcSwap<BTreeMap<u64, Arc<Backend>>>,
    virtual_nodes: usize,
    initialized: AtomicBool,
    /// Serializes rebuilds with each other; never held by lookups.
    rebuild_lock: Mutex<()>,
}

impl ConsistentHashing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            ring: ArcSwap::from_pointee(BTreeMap::new()),
            virtual_nodes,
            initialized: AtomicBool::new(false),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// 64-bit ring position for a key: the first 8 bytes of its MD5
    /// digest read as a signed big-endian integer, then the absolute
    /// value. The sign normalization is part of the placement contract
    /// and must not change.
    pub fn hash(key: &str) -> u64 {
        let digest = Md5::digest(key.as_bytes());
        let mut first8 = [0u8; 8];
        first8.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(first8).unsigned_abs()
    }

    /// True when the backends on the ring no longer match the healthy
    /// snapshot (by id).
    fn needs_rebuild(&self, healthy: &[Arc<Backend>]) -> bool {
        let ring = self.ring.load();
        let on_ring: HashSet<&str> = ring.values().map(|b| b.id()).collect();
        let in_snapshot: HashSet<&str> = healthy.iter().map(|b| b.id()).collect();
        on_ring != in_snapshot
    }

    /// Builds a fresh ring from the healthy snapshot and swaps it in.
    /// Double-checks under the lock so racing selectors rebuild once.
    fn rebuild(&self, healthy: &[Arc<Backend>]) {
        let _guard = self.rebuild_lock.lock().expect("rebuild lock poisoned");
        if self.initialized.load(Ordering::Acquire) && !self.needs_rebuild(healthy) {
            return;
        }

        let mut ring = BTreeMap::new();
        for backend in healthy {
            Self::add_to_ring(&mut ring, backend, self.virtual_nodes);
        }

        info!(
            backends = healthy.len(),
            virtual_nodes = ring.len(),
            "rebuilt consistent hash ring"
        );

        self.ring.store(Arc::new(ring));
        self.initialized.store(true, Ordering::Release);
    }

    fn add_to_ring(ring: &mut BTreeMap<u64, Arc<Backend>>, backend: &Arc<Backend>, count: usize) {
        for i in 0..count {
            let key = format!("{}#{i}", backend.id());
            ring.insert(Self::hash(&key), Arc::clone(backend));
        }
    }

    fn lookup(ring: &BTreeMap<u64, Arc<Backend>>, client_hash: u64) -> Option<Arc<Backend>> {
        ring.range(client_hash..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, backend)| Arc::clone(backend))
    }

    fn client_key(client_info: &str) -> &str {
        let trimmed = client_info.trim();
        if trimmed.is_empty() { "unknown-client" } else { client_info }
    }

    /// Where the given client would land, without claiming a connection.
    /// Rebuilds the ring first if it is stale against the snapshot.
    pub fn predict(&self, healthy: &[Arc<Backend>], client_info: &str) -> Option<Arc<Backend>> {
        if !self.initialized.load(Ordering::Acquire) || self.needs_rebuild(healthy) {
            self.rebuild(healthy);
        }

        let ring = self.ring.load();
        Self::lookup(&ring, Self::hash(Self::client_key(client_info)))
    }

    /// Number of entries on the current ring.
    pub fn ring_len(&self) -> usize {
        self.ring.load().len()
    }

    /// Virtual-node count per backend id on the current ring.
    pub fn ring_distribution(&self) -> HashMap<String, usize> {
        let ring = self.ring.load();
        let mut distribution = HashMap::new();
        for backend in ring.values() {
            *distribution.entry(backend.id().to_string()).or_insert(0) += 1;
        }
        distribution
    }
}

impl Strategy for ConsistentHashing {
    fn name(&self) -> &'static str {
        "consistentHashing"
    }

    fn select(&self, healthy: &[Arc<Backend>], client_info: &str) -> Result<Arc<Backend>> {
        if healthy.is_empty() {
            return Err(BalancerError::NoHealthyBackend);
        }

        if !self.initialized.load(Ordering::Acquire) || self.needs_rebuild(healthy) {
            self.rebuild(healthy);
        }

        let ring = self.ring.load();
        let client_hash = Self::hash(Self::client_key(client_info));
        let selected = Self::lookup(&ring, client_hash).ok_or(BalancerError::NoHealthyBackend)?;

        selected.increment_connections();
        debug!(
            client_hash,
            backend = selected.id(),
            "consistent hashing selection"
        );
        Ok(selected)
    }

    fn on_init(&self, backends: &[Arc<Backend>]) {
        let healthy: Vec<Arc<Backend>> = backends
            .iter()
            .filter(|b| b.is_healthy())
            .cloned()
            .collect();
        self.rebuild(&healthy);
    }

    fn on_add(&self, backend: &Arc<Backend>) {
        if !backend.is_healthy() {
            return;
        }

        let _guard = self.rebuild_lock.lock().expect("rebuild lock poisoned");
        let mut ring = BTreeMap::clone(&self.ring.load());
        Self::add_to_ring(&mut ring, backend, self.virtual_nodes);
        self.ring.store(Arc::new(ring));
    }

    fn on_remove(&self, backend: &Arc<Backend>) {
        let _guard = self.rebuild_lock.lock().expect("rebuild lock poisoned");
        let mut ring = BTreeMap::clone(&self.ring.load());
        for i in 0..self.virtual_nodes {
            let key = format!("{}#{i}", backend.id());
            ring.remove(&Self::hash(&key));
        }
        self.ring.store(Arc::new(ring));
    }
}
