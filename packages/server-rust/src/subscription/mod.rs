//! Subscription registry and reconciliation.
//!
//! The registry is the in-memory catalog of subscription sources and, for
//! each, the set of node hashes it currently manages (with per-node tags).
//! The link set is authoritative for "is this node still managed"; the
//! scheduler ([`scheduler`]) reconciles it against each source, and the pool
//! consults it for reference counts and tag lookups.

pub mod parser;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use resin_core::Subscription;

pub use parser::{parse_outbounds, ParsedOutbound};
pub use scheduler::SubscriptionScheduler;

// ---------------------------------------------------------------------------
// Link state
// ---------------------------------------------------------------------------

/// Per-node state of one subscription→node link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    pub tags: Vec<String>,
    /// An evicted link no longer counts as a reference, but records intent
    /// to re-add the node if the source lists it again.
    pub evicted: bool,
    /// When the link was evicted (0 when not evicted).
    pub evicted_at_ns: i64,
}

impl LinkState {
    fn active(tags: Vec<String>) -> Self {
        Self {
            tags,
            evicted: false,
            evicted_at_ns: 0,
        }
    }
}

/// Result of attaching a node to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The link did not exist before.
    Created,
    /// The link existed with `evicted = true` and was revived.
    Revived,
    /// The link existed and its tags changed.
    TagsChanged,
    /// The link existed and nothing changed.
    Unchanged,
}

impl AttachOutcome {
    /// Whether the link row changed and needs a dirty mark.
    #[must_use]
    pub fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

// ---------------------------------------------------------------------------
// SubscriptionEntry
// ---------------------------------------------------------------------------

/// Runtime-only fetch state; never persisted.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRuntime {
    pub last_checked_ns: i64,
    pub last_updated_ns: i64,
    pub last_error: Option<String>,
}

/// One catalog entry: the persisted spec, runtime fetch state, and the
/// managed node set.
pub struct SubscriptionEntry {
    spec: RwLock<Subscription>,
    runtime: Mutex<SubscriptionRuntime>,
    managed: Mutex<HashMap<String, LinkState>>,
    /// Per-subscription non-reentrancy for refresh cycles.
    refresh_flag: std::sync::atomic::AtomicBool,
}

impl SubscriptionEntry {
    fn new(spec: Subscription) -> Self {
        Self {
            spec: RwLock::new(spec),
            runtime: Mutex::new(SubscriptionRuntime::default()),
            managed: Mutex::new(HashMap::new()),
            refresh_flag: std::sync::atomic::AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn spec(&self) -> Subscription {
        self.spec.read().clone()
    }

    pub fn set_spec(&self, spec: Subscription) {
        *self.spec.write() = spec;
    }

    #[must_use]
    pub fn runtime(&self) -> SubscriptionRuntime {
        self.runtime.lock().clone()
    }

    pub fn with_runtime(&self, f: impl FnOnce(&mut SubscriptionRuntime)) {
        f(&mut self.runtime.lock());
    }

    /// Claims the refresh slot. Returns `false` when a cycle is already in
    /// flight.
    #[must_use]
    pub fn try_begin_refresh(&self) -> bool {
        self.refresh_flag
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn end_refresh(&self) {
        self.refresh_flag
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Snapshot of the managed set.
    #[must_use]
    pub fn managed(&self) -> HashMap<String, LinkState> {
        self.managed.lock().clone()
    }

    #[must_use]
    pub fn link(&self, hash: &str) -> Option<LinkState> {
        self.managed.lock().get(hash).cloned()
    }
}

// ---------------------------------------------------------------------------
// SubscriptionRegistry
// ---------------------------------------------------------------------------

/// Concurrent catalog of subscriptions and their managed node sets.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<Uuid, Arc<SubscriptionEntry>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, spec: Subscription) -> Arc<SubscriptionEntry> {
        let entry = Arc::new(SubscriptionEntry::new(spec.clone()));
        self.entries.insert(spec.id, Arc::clone(&entry));
        entry
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<SubscriptionEntry>> {
        self.entries.remove(id).map(|(_, entry)| entry)
    }

    #[must_use]
    pub fn get(&self, id: &Uuid) -> Option<Arc<SubscriptionEntry>> {
        self.entries.get(id).map(|e| Arc::clone(e.value()))
    }

    #[must_use]
    pub fn list(&self) -> Vec<Arc<SubscriptionEntry>> {
        let mut entries: Vec<Arc<SubscriptionEntry>> = self
            .entries
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        entries.sort_by_key(|e| e.spec().name);
        entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attaches (or updates) a subscription→node link.
    pub fn attach(&self, id: &Uuid, hash: &str, tags: Vec<String>) -> Option<AttachOutcome> {
        let entry = self.get(id)?;
        let mut managed = entry.managed.lock();
        let outcome = match managed.get_mut(hash) {
            None => {
                managed.insert(hash.to_string(), LinkState::active(tags));
                AttachOutcome::Created
            }
            Some(state) if state.evicted => {
                *state = LinkState::active(tags);
                AttachOutcome::Revived
            }
            Some(state) if state.tags != tags => {
                state.tags = tags;
                AttachOutcome::TagsChanged
            }
            Some(_) => AttachOutcome::Unchanged,
        };
        Some(outcome)
    }

    /// Removes the link entirely, returning its final state.
    pub fn detach(&self, id: &Uuid, hash: &str) -> Option<LinkState> {
        let entry = self.get(id)?;
        let mut managed = entry.managed.lock();
        managed.remove(hash)
    }

    /// Marks a link evicted. Returns `false` if there is no such active
    /// link.
    pub fn mark_evicted(&self, id: &Uuid, hash: &str, now_ns: i64) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        let mut managed = entry.managed.lock();
        match managed.get_mut(hash) {
            Some(state) if !state.evicted => {
                state.evicted = true;
                state.evicted_at_ns = now_ns;
                true
            }
            _ => false,
        }
    }

    /// Every subscription referencing the node, with eviction status.
    #[must_use]
    pub fn refs_for_node(&self, hash: &str) -> Vec<(Uuid, bool)> {
        let mut refs = Vec::new();
        for entry in &self.entries {
            if let Some(state) = entry.value().link(hash) {
                refs.push((*entry.key(), state.evicted));
            }
        }
        refs
    }

    /// Whether any non-evicted link references the node.
    #[must_use]
    pub fn is_managed(&self, hash: &str) -> bool {
        self.refs_for_node(hash).iter().any(|(_, evicted)| !evicted)
    }

    /// Sorted, deduplicated union of the node's tags across its non-evicted
    /// links.
    #[must_use]
    pub fn tags_for_node(&self, hash: &str) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        for entry in &self.entries {
            if let Some(state) = entry.value().link(hash) {
                if !state.evicted {
                    tags.extend(state.tags.iter().cloned());
                }
            }
        }
        tags.sort();
        tags.dedup();
        tags
    }

    /// Every evicted link with its deadline inputs:
    /// `(subscription_id, node_hash, evicted_at_ns, evict_delay_ns)`.
    #[must_use]
    pub fn evicted_links(&self) -> Vec<(Uuid, String, i64, i64)> {
        let mut links = Vec::new();
        for entry in &self.entries {
            let delay = entry.value().spec.read().ephemeral_node_evict_delay_ns;
            for (hash, state) in entry.value().managed.lock().iter() {
                if state.evicted {
                    links.push((*entry.key(), hash.clone(), state.evicted_at_ns, delay));
                }
            }
        }
        links
    }

    /// Rebuilds links from persisted rows at boot; no dirty marks.
    pub fn hydrate_link(&self, id: &Uuid, hash: String, tags: Vec<String>, evicted: bool) {
        if let Some(entry) = self.get(id) {
            entry.managed.lock().insert(
                hash,
                LinkState {
                    tags,
                    evicted,
                    evicted_at_ns: 0,
                },
            );
        }
    }
}
