//! Node records: immutable identity, mutable health, per-authority latency.
//!
//! A node is an outbound-proxy candidate. Its static half is fixed at
//! creation (identity is the content hash of its canonical raw options); its
//! dynamic half tracks circuit-breaker state, egress attribution, and probe
//! timestamps. The latency table keeps a bounded per-authority EWMA.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Returns `true` for a valid egress region code: empty (unknown) or exactly
/// two lowercase ASCII letters.
#[must_use]
pub fn is_region_code(code: &str) -> bool {
    code.is_empty()
        || (code.len() == 2 && code.bytes().all(|b| b.is_ascii_lowercase()))
}

// ---------------------------------------------------------------------------
// NodeStatic
// ---------------------------------------------------------------------------

/// Immutable node state, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatic {
    /// Lowercase-hex SHA-256 of `raw_options`; the node's identity.
    pub hash: String,
    /// Canonical raw outbound options, preserved verbatim for the outbound
    /// transport builder.
    pub raw_options: Vec<u8>,
    pub created_at_ns: i64,
}

// ---------------------------------------------------------------------------
// NodeDynamic
// ---------------------------------------------------------------------------

/// Mutable node state: circuit breaker, egress attribution, probe stamps.
///
/// Invariant: `circuit_open_since_ns > 0` exactly when `failure_count` has
/// reached the configured consecutive-failure limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDynamic {
    pub failure_count: u32,
    /// 0 = circuit closed; otherwise the time the circuit opened.
    pub circuit_open_since_ns: i64,
    pub egress_ip: Option<String>,
    /// Two lowercase letters, or "" when unknown.
    pub egress_region: String,
    pub egress_updated_at_ns: i64,
    pub last_latency_probe_at_ns: i64,
    pub last_authority_probe_at_ns: i64,
    pub last_egress_probe_at_ns: i64,
}

impl NodeDynamic {
    #[must_use]
    pub fn circuit_open(&self) -> bool {
        self.circuit_open_since_ns > 0
    }

    /// Records a successful request: resets the failure streak and closes
    /// the circuit.
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.circuit_open_since_ns = 0;
    }

    /// Records a failed request; opens the circuit once the streak reaches
    /// `max_consecutive_failures`. Returns `true` if this call opened it.
    pub fn record_failure(&mut self, now_ns: i64, max_consecutive_failures: u32) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        if self.failure_count >= max_consecutive_failures && self.circuit_open_since_ns == 0 {
            self.circuit_open_since_ns = now_ns;
            return true;
        }
        false
    }

    /// Updates egress attribution from a probe result.
    pub fn set_egress(&mut self, ip: String, region: String, now_ns: i64) {
        debug_assert!(is_region_code(&region));
        self.egress_ip = Some(ip);
        self.egress_region = region;
        self.egress_updated_at_ns = now_ns;
        self.last_egress_probe_at_ns = now_ns;
    }
}

// ---------------------------------------------------------------------------
// LatencyTable
// ---------------------------------------------------------------------------

/// One EWMA bucket of the latency table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyEntry {
    pub ewma_ns: f64,
    pub last_updated_ns: i64,
}

/// Per-node latency statistics keyed by authority domain.
///
/// The wildcard bucket `""` aggregates observations across all authorities
/// and is the fallback the selection policy reads when a specific authority
/// is not tracked. Bounded to `max_entries` authorities; the least recently
/// updated non-wildcard bucket is evicted when full.
#[derive(Debug, Clone, Default)]
pub struct LatencyTable {
    entries: HashMap<String, LatencyEntry>,
}

impl LatencyTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds an observation into the authority's bucket.
    ///
    /// The previous average decays with the configured half-life: an entry
    /// `half_life_ns` old contributes half its weight. The blend floor keeps
    /// back-to-back probes from being ignored entirely at `dt == 0`.
    pub fn observe(
        &mut self,
        authority: &str,
        observed_ns: i64,
        now_ns: i64,
        half_life_ns: i64,
        max_entries: usize,
    ) {
        #[allow(clippy::cast_precision_loss)]
        let observed = observed_ns.max(0) as f64;
        match self.entries.get_mut(authority) {
            Some(entry) => {
                let dt = (now_ns - entry.last_updated_ns).max(0);
                #[allow(clippy::cast_precision_loss)]
                let age = dt as f64 / half_life_ns.max(1) as f64;
                let keep = f64::powf(0.5, age).min(0.875);
                entry.ewma_ns = entry.ewma_ns * keep + observed * (1.0 - keep);
                entry.last_updated_ns = now_ns;
            }
            None => {
                if !authority.is_empty() && self.entries.len() >= max_entries.max(1) {
                    self.evict_lru();
                }
                self.entries.insert(
                    authority.to_string(),
                    LatencyEntry {
                        ewma_ns: observed,
                        last_updated_ns: now_ns,
                    },
                );
            }
        }
    }

    /// Current EWMA for an authority, if tracked.
    #[must_use]
    pub fn ewma(&self, authority: &str) -> Option<f64> {
        self.entries.get(authority).map(|e| e.ewma_ns)
    }

    #[must_use]
    pub fn get(&self, authority: &str) -> Option<LatencyEntry> {
        self.entries.get(authority).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates `(authority, entry)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &LatencyEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Replaces an entry wholesale; used when hydrating from the weak store.
    pub fn restore(&mut self, authority: String, entry: LatencyEntry) {
        self.entries.insert(authority, entry);
    }

    pub fn remove(&mut self, authority: &str) -> Option<LatencyEntry> {
        self.entries.remove(authority)
    }

    /// Evicts the least recently updated non-wildcard bucket.
    fn evict_lru(&mut self) {
        let victim = self
            .entries
            .iter()
            .filter(|(k, _)| !k.is_empty())
            .min_by_key(|(_, e)| e.last_updated_ns)
            .map(|(k, _)| k.clone());
        if let Some(victim) = victim {
            self.entries.remove(&victim);
        }
    }
}
