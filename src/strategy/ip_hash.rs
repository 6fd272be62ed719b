//! IP-hash selection with a sticky client→backend cache.
//!
//! The client identity is normalized to a dotted-quad IPv4 address: real
//! addresses pass through, anything else (hostnames, session tokens) is
//! folded through a 31-based rolling hash into a synthetic quad, and
//! blank input maps to `127.0.0.1`. The quad, read as a 32-bit big-endian
//! integer, indexes the healthy snapshot.
//!
//! Repeated requests from one client must keep landing on the same
//! backend while it stays healthy, so resolved mappings are cached. The
//! cache check, staleness validation, and refresh happen while holding
//! the entry's shard guard, which keeps check-then-act races out: two
//! concurrent first requests from one client agree on the mapping.

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::strategy::Strategy;
use crate::{BalancerError, Result};

/// Fallback identity for blank client info.
const DEFAULT_CLIENT_IP: &str = "127.0.0.1";

pub struct IpHash {
    ip_pattern: Regex,
    /// Sticky client-ip → backend-id mapping.
    mapping: DashMap<String, String>,
}

impl IpHash {
    pub fn new() -> Self {
        Self {
            ip_pattern: Regex::new(
                r"^((25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)$",
            )
            .expect("IPv4 pattern must compile"),
            mapping: DashMap::new(),
        }
    }

    /// Returns `true` if the input is a well-formed dotted-quad IPv4
    /// address (after trimming).
    pub fn is_valid_ip(&self, input: &str) -> bool {
        self.ip_pattern.is_match(input.trim())
    }

    /// Normalizes arbitrary client info to a dotted-quad address.
    ///
    /// Non-address input is folded through a 31-based rolling hash over
    /// its UTF-16 code units; each octet is taken from a successive 8-bit
    /// window of the hash as `(|window| % 255) + 1`, which lands every
    /// octet in `[1, 255]`.
    pub fn extract_ip(&self, client_info: &str) -> String {
        let trimmed = client_info.trim();
        if trimmed.is_empty() {
            return DEFAULT_CLIENT_IP.to_string();
        }
        if self.ip_pattern.is_match(trimmed) {
            return trimmed.to_string();
        }

        let mut hash: i32 = 0;
        for unit in client_info.encode_utf16() {
            hash = hash.wrapping_mul(31).wrapping_add(i32::from(unit));
        }

        let octet = |shift: u32| (hash >> shift).unsigned_abs() % 255 + 1;
        format!("{}.{}.{}.{}", octet(0), octet(8), octet(16), octet(24))
    }

    /// Hash of a dotted-quad address: the quad read as a 32-bit
    /// big-endian integer (wrapping).
    pub fn ip_hash(&self, client_info: &str) -> i32 {
        let ip = self.extract_ip(client_info);
        ip.split('.')
            .filter_map(|octet| octet.parse::<i32>().ok())
            .fold(0i32, |hash, octet| {
                hash.wrapping_mul(256).wrapping_add(octet)
            })
    }

    fn pick_id(&self, client_ip: &str, healthy: &[Arc<Backend>]) -> String {
        let hash = self.ip_hash(client_ip);
        let index = hash.unsigned_abs() as usize % healthy.len();
        healthy[index].id().to_string()
    }

    /// Where the given client would land, without caching or claiming a
    /// connection.
    pub fn predict<'a>(
        &self,
        healthy: &'a [Arc<Backend>],
        client_info: &str,
    ) -> Option<&'a Arc<Backend>> {
        if healthy.is_empty() {
            return None;
        }
        let ip = self.extract_ip(client_info);
        let index = self.ip_hash(&ip).unsigned_abs() as usize % healthy.len();
        Some(&healthy[index])
    }

    /// Number of cached client mappings.
    pub fn cache_len(&self) -> usize {
        self.mapping.len()
    }

    #[cfg(test)]
    pub fn clear_cache(&self) {
        self.mapping.clear();
    }
}

impl Default for IpHash {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for IpHash {
    fn name(&self) -> &'static str {
        "ipHash"
    }

    fn select(&self, healthy: &[Arc<Backend>], client_info: &str) -> Result<Arc<Backend>> {
        if healthy.is_empty() {
            return Err(BalancerError::NoHealthyBackend);
        }

        let client_ip = self.extract_ip(client_info);

        // The entry guard holds the shard lock, making lookup, staleness
        // validation, and refresh one atomic step per client.
        let selected_id = {
            let mut entry = self
                .mapping
                .entry(client_ip.clone())
                .or_insert_with(|| self.pick_id(&client_ip, healthy));

            let still_healthy = healthy.iter().any(|b| b.id() == entry.value().as_str());
            if !still_healthy {
                debug!(
                    client = %client_ip,
                    stale = %entry.value(),
                    "cached backend no longer healthy, remapping"
                );
                *entry.value_mut() = self.pick_id(&client_ip, healthy);
            }

            entry.value().clone()
        };

        // The snapshot cannot change underneath us, but the same id may
        // have been remapped by a registry event between the atomic
        // section and here. Fall back rather than fail the request.
        let selected = match healthy.iter().find(|b| b.id() == selected_id) {
            Some(backend) => Arc::clone(backend),
            None => {
                warn!(
                    client = %client_ip,
                    backend = %selected_id,
                    "mapped backend vanished from snapshot, falling back to first healthy"
                );
                self.mapping.remove(&client_ip);
                Arc::clone(&healthy[0])
            }
        };

        selected.increment_connections();
        debug!(client = %client_ip, backend = selected.id(), "ip hash selection");
        Ok(selected)
    }

    fn on_remove(&self, backend: &Arc<Backend>) {
        self.mapping.retain(|_, mapped_id| mapped_id != backend.id());
        info!(backend = backend.id(), "purged sticky mappings for removed backend");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidatedBackend;

    fn pool(ids: &[&str]) -> Vec<Arc<Backend>> {
        ids.iter()
            .map(|id| {
                Arc::new(Backend::new(
                    &ValidatedBackend {
                        id: (*id).into(),
                        uri: format!("http://{id}:5001").parse().unwrap(),
                        weight: 1,
                    },
                    10,
                ))
            })
            .collect()
    }

    #[test]
    fn valid_addresses_pass_through() {
        let strategy = IpHash::new();
        assert_eq!(strategy.extract_ip("192.168.1.100"), "192.168.1.100");
        assert_eq!(strategy.extract_ip("  10.0.0.1  "), "10.0.0.1");
        assert_eq!(strategy.extract_ip("255.255.255.255"), "255.255.255.255");
    }

    #[test]
    fn blank_input_maps_to_loopback() {
        let strategy = IpHash::new();
        assert_eq!(strategy.extract_ip(""), "127.0.0.1");
        assert_eq!(strategy.extract_ip("   "), "127.0.0.1");
    }

    #[test]
    fn non_address_input_folds_to_synthetic_quad() {
        let strategy = IpHash::new();

        let synthetic = strategy.extract_ip("session-abc-123");
        assert!(strategy.is_valid_ip(&synthetic));
        for octet in synthetic.split('.') {
            let value: u32 = octet.parse().unwrap();
            assert!((1..=255).contains(&value), "octet {value} out of range");
        }
    }

    #[test]
    fn out_of_range_octets_are_not_addresses() {
        let strategy = IpHash::new();
        assert!(!strategy.is_valid_ip("256.1.1.1"));
        assert!(!strategy.is_valid_ip("1.2.3"));
        assert!(!strategy.is_valid_ip("1.2.3.4.5"));
    }

    #[test]
    fn hashing_is_deterministic() {
        let strategy = IpHash::new();
        assert_eq!(strategy.ip_hash("192.168.1.100"), strategy.ip_hash("192.168.1.100"));
        assert_eq!(
            strategy.ip_hash("some-client"),
            strategy.ip_hash("some-client")
        );
    }

    #[test]
    fn quad_hash_is_big_endian_integer() {
        let strategy = IpHash::new();
        // 1.2.3.4 = 0x01020304.
        assert_eq!(strategy.ip_hash("1.2.3.4"), 0x0102_0304);
    }

    #[test]
    fn repeated_selects_stick_to_one_backend() {
        let healthy = pool(&["s1", "s2", "s3", "s4"]);
        let strategy = IpHash::new();

        let first = strategy.select(&healthy, "192.168.1.100").unwrap();
        strategy.record(&first, 5, true);

        for _ in 0..9 {
            let next = strategy.select(&healthy, "192.168.1.100").unwrap();
            assert_eq!(next.id(), first.id());
            strategy.record(&next, 5, true);
        }

        assert_eq!(strategy.cache_len(), 1);
    }

    #[test]
    fn unhealthy_cached_backend_is_remapped() {
        let healthy = pool(&["s1", "s2", "s3", "s4"]);
        let strategy = IpHash::new();

        let first = strategy.select(&healthy, "192.168.1.100").unwrap();
        strategy.record(&first, 5, true);

        // The cached backend drops out of the snapshot.
        let reduced: Vec<Arc<Backend>> = healthy
            .iter()
            .filter(|b| b.id() != first.id())
            .cloned()
            .collect();

        let remapped = strategy.select(&reduced, "192.168.1.100").unwrap();
        assert_ne!(remapped.id(), first.id());

        // The new mapping sticks in turn.
        let again = strategy.select(&reduced, "192.168.1.100").unwrap();
        assert_eq!(again.id(), remapped.id());
    }

    #[test]
    fn on_remove_purges_matching_mappings() {
        let healthy = pool(&["s1", "s2"]);
        let strategy = IpHash::new();

        // Fill the cache from enough distinct clients to hit both backends.
        for i in 0..8 {
            let client = format!("10.0.0.{i}");
            let b = strategy.select(&healthy, &client).unwrap();
            strategy.record(&b, 5, true);
        }
        let before = strategy.cache_len();
        assert_eq!(before, 8);

        strategy.on_remove(&healthy[0]);
        let purged: Vec<String> = (0..8)
            .map(|i| format!("10.0.0.{i}"))
            .filter(|client| {
                strategy
                    .predict(&healthy, client)
                    .is_some_and(|b| b.id() == "s1")
            })
            .collect();
        assert_eq!(strategy.cache_len(), before - purged.len());
    }

    #[test]
    fn predict_has_no_side_effects() {
        let healthy = pool(&["s1", "s2", "s3"]);
        let strategy = IpHash::new();

        let predicted = strategy.predict(&healthy, "192.168.1.100").unwrap();
        assert_eq!(predicted.current_connections(), 0);
        assert_eq!(strategy.cache_len(), 0);

        let selected = strategy.select(&healthy, "192.168.1.100").unwrap();
        assert_eq!(selected.id(), predicted.id());
    }

    #[test]
    fn empty_snapshot_is_an_error() {
        let strategy = IpHash::new();
        assert!(matches!(
            strategy.select(&[], "client"),
            Err(BalancerError::NoHealthyBackend)
        ));
    }
}
