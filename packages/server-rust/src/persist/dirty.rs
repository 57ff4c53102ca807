//! Dirty sets: pending weak-store writes, one set per weak table.
//!
//! High-churn runtime state (nodes, leases, latency) is never written
//! synchronously. Mutations mark a key dirty; the flush worker drains the
//! sets, reads the current in-memory values back, and commits a batch. A
//! drained snapshot can be merged back after a failed commit without
//! clobbering marks recorded in the meantime.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;
use uuid::Uuid;

/// Pending intent for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyMark {
    Upsert,
    Delete,
}

/// One table's pending writes: `key -> {UPSERT, DELETE}`.
///
/// Marking is O(1) and last-write-wins. `drain` atomically swaps in a fresh
/// map, so concurrent marks after the drain accumulate in the new map.
#[derive(Debug, Default)]
pub struct DirtySet<K: Eq + Hash> {
    inner: Mutex<HashMap<K, DirtyMark>>,
}

impl<K: Eq + Hash + Clone> DirtySet<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Records that the key's in-memory value should be written.
    pub fn mark_upsert(&self, key: K) {
        self.inner.lock().insert(key, DirtyMark::Upsert);
    }

    /// Records that the key's row should be removed.
    pub fn mark_delete(&self, key: K) {
        self.inner.lock().insert(key, DirtyMark::Delete);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Atomically takes the current marks, leaving an empty set behind.
    #[must_use]
    pub fn drain(&self) -> HashMap<K, DirtyMark> {
        std::mem::take(&mut *self.inner.lock())
    }

    /// Restores a drained snapshot after a failed flush.
    ///
    /// A key re-marked since the drain keeps its newer mark; the snapshot
    /// fills in only the keys with no pending mark, so no intent is ever
    /// lost and no stale intent wins.
    pub fn merge(&self, snapshot: HashMap<K, DirtyMark>) {
        let mut inner = self.inner.lock();
        for (key, mark) in snapshot {
            inner.entry(key).or_insert(mark);
        }
    }
}

// ---------------------------------------------------------------------------
// DirtyTracker
// ---------------------------------------------------------------------------

/// Key of a `node_latency` row: `(node_hash, authority)`.
pub type LatencyKey = (String, String);
/// Key of a `leases` row: `(platform_id, account)`.
pub type LeaseRowKey = (Uuid, String);
/// Key of a `subscription_nodes` row: `(subscription_id, node_hash)`.
pub type LinkKey = (Uuid, String);

/// All five weak-table dirty sets.
#[derive(Debug, Default)]
pub struct DirtyTracker {
    pub nodes_static: DirtySet<String>,
    pub nodes_dynamic: DirtySet<String>,
    pub node_latency: DirtySet<LatencyKey>,
    pub leases: DirtySet<LeaseRowKey>,
    pub subscription_nodes: DirtySet<LinkKey>,
}

/// The drained snapshots of all five sets, taken together at flush time.
#[derive(Debug, Default)]
pub struct DirtySnapshots {
    pub nodes_static: HashMap<String, DirtyMark>,
    pub nodes_dynamic: HashMap<String, DirtyMark>,
    pub node_latency: HashMap<LatencyKey, DirtyMark>,
    pub leases: HashMap<LeaseRowKey, DirtyMark>,
    pub subscription_nodes: HashMap<LinkKey, DirtyMark>,
}

impl DirtySnapshots {
    #[must_use]
    pub fn total(&self) -> usize {
        self.nodes_static.len()
            + self.nodes_dynamic.len()
            + self.node_latency.len()
            + self.leases.len()
            + self.subscription_nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl DirtyTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total pending marks across all tables; drives the flush threshold
    /// trigger and the dirty-count gauge.
    #[must_use]
    pub fn total(&self) -> usize {
        self.nodes_static.len()
            + self.nodes_dynamic.len()
            + self.node_latency.len()
            + self.leases.len()
            + self.subscription_nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Drains every set. The per-set swaps are individually atomic; a mark
    /// racing the drain lands either in this snapshot or in the fresh set.
    #[must_use]
    pub fn drain_all(&self) -> DirtySnapshots {
        DirtySnapshots {
            nodes_static: self.nodes_static.drain(),
            nodes_dynamic: self.nodes_dynamic.drain(),
            node_latency: self.node_latency.drain(),
            leases: self.leases.drain(),
            subscription_nodes: self.subscription_nodes.drain(),
        }
    }

    /// Merges a drained snapshot back after a failed flush.
    pub fn merge_all(&self, snapshots: DirtySnapshots) {
        self.nodes_static.merge(snapshots.nodes_static);
        self.nodes_dynamic.merge(snapshots.nodes_dynamic);
        self.node_latency.merge(snapshots.node_latency);
        self.leases.merge(snapshots.leases);
        self.subscription_nodes.merge(snapshots.subscription_nodes);
    }
}
