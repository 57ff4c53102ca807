//! A pooled node: immutable statics plus lock-striped mutable state.
//!
//! The pool's main index maps hash → `Arc<NodeEntry>`. Dynamic mutations
//! (health, egress, latency) take only the entry's own locks, so concurrent
//! mutations on different nodes never contend.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use resin_core::{LatencyEntry, LatencyTable, NodeDynamic, NodeStatic, OutboundTransport};

/// One node in the pool.
pub struct NodeEntry {
    statics: NodeStatic,
    dynamic: Mutex<NodeDynamic>,
    latency: Mutex<LatencyTable>,
    /// Present once the outbound builder has produced a transport; gates
    /// candidacy.
    outbound: RwLock<Option<Arc<dyn OutboundTransport>>>,
}

impl NodeEntry {
    #[must_use]
    pub fn new(statics: NodeStatic, dynamic: NodeDynamic) -> Self {
        Self {
            statics,
            dynamic: Mutex::new(dynamic),
            latency: Mutex::new(LatencyTable::new()),
            outbound: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn hash(&self) -> &str {
        &self.statics.hash
    }

    #[must_use]
    pub fn statics(&self) -> &NodeStatic {
        &self.statics
    }

    /// Runs `f` under the dynamic-state lock.
    pub fn with_dynamic<R>(&self, f: impl FnOnce(&mut NodeDynamic) -> R) -> R {
        f(&mut self.dynamic.lock())
    }

    #[must_use]
    pub fn dynamic(&self) -> NodeDynamic {
        self.dynamic.lock().clone()
    }

    #[must_use]
    pub fn circuit_open(&self) -> bool {
        self.dynamic.lock().circuit_open()
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.dynamic.lock().failure_count
    }

    #[must_use]
    pub fn egress_ip(&self) -> Option<String> {
        self.dynamic.lock().egress_ip.clone()
    }

    /// Runs `f` under the latency-table lock.
    pub fn with_latency<R>(&self, f: impl FnOnce(&mut LatencyTable) -> R) -> R {
        f(&mut self.latency.lock())
    }

    /// EWMA for an authority bucket, if tracked.
    #[must_use]
    pub fn ewma(&self, bucket: &str) -> Option<f64> {
        self.latency.lock().ewma(bucket)
    }

    #[must_use]
    pub fn latency_entry(&self, bucket: &str) -> Option<LatencyEntry> {
        self.latency.lock().get(bucket)
    }

    /// Authorities currently tracked for this node.
    #[must_use]
    pub fn latency_buckets(&self) -> Vec<String> {
        self.latency
            .lock()
            .iter()
            .map(|(k, _)| k.to_string())
            .collect()
    }

    pub fn set_outbound(&self, transport: Arc<dyn OutboundTransport>) {
        *self.outbound.write() = Some(transport);
    }

    pub fn clear_outbound(&self) {
        *self.outbound.write() = None;
    }

    #[must_use]
    pub fn has_outbound(&self) -> bool {
        self.outbound.read().is_some()
    }

    #[must_use]
    pub fn outbound(&self) -> Option<Arc<dyn OutboundTransport>> {
        self.outbound.read().clone()
    }
}

impl std::fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEntry")
            .field("hash", &self.statics.hash)
            .field("has_outbound", &self.has_outbound())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTransport;
    impl OutboundTransport for FakeTransport {}

    fn entry() -> NodeEntry {
        NodeEntry::new(
            NodeStatic {
                hash: "h1".to_string(),
                raw_options: b"{}".to_vec(),
                created_at_ns: 1,
            },
            NodeDynamic::default(),
        )
    }

    #[test]
    fn outbound_slot_gates_candidacy() {
        let entry = entry();
        assert!(!entry.has_outbound());

        entry.set_outbound(Arc::new(FakeTransport));
        assert!(entry.has_outbound());
        assert!(entry.outbound().is_some());

        entry.clear_outbound();
        assert!(!entry.has_outbound());
    }

    #[test]
    fn dynamic_mutations_are_visible() {
        let entry = entry();
        entry.with_dynamic(|d| {
            d.record_failure(10, 1);
        });
        assert!(entry.circuit_open());
        assert_eq!(entry.failure_count(), 1);
    }

    #[test]
    fn latency_buckets_enumerate() {
        let entry = entry();
        entry.with_latency(|t| {
            t.observe("", 100, 0, 1_000, 4);
            t.observe("example.com", 100, 0, 1_000, 4);
        });
        let mut buckets = entry.latency_buckets();
        buckets.sort();
        assert_eq!(buckets, vec!["".to_string(), "example.com".to_string()]);
        assert_eq!(entry.ewma(""), Some(100.0));
        assert_eq!(entry.ewma("missing.net"), None);
    }
}
