//! The node pool: the in-memory fleet of outbound candidates.
//!
//! Owns the node index, accepts additions from subscriptions, mediates all
//! dynamic-state mutation (circuit breaker, egress attribution, latency),
//! and computes routable candidate views ([`candidates`]).
//!
//! Concurrency: the main index sits behind a single readers-writer lock
//! (add/remove are the only writers); each entry stripes its own dynamic
//! state behind per-entry locks ([`entry`]). Lease liveness is consulted
//! through an injected probe, never while holding the index lock.

pub mod candidates;
pub mod entry;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use resin_core::{
    is_region_code, node_hash, Clock, Error, GeoLookup, NodeDynamic, NodeStatic, OutboundBuilder,
    Result, SystemConfig,
};

use crate::persist::DirtyTracker;
use crate::shutdown::ShutdownController;
use crate::subscription::{AttachOutcome, SubscriptionRegistry};

pub use candidates::{compute_candidates, CandidateCache, PlatformRuntime};
pub use entry::NodeEntry;

/// Asks the routing engine whether any live lease still points at a node.
pub type LeaseProbe = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Result of [`NodePool::add_from_subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    pub hash: String,
    /// Whether the node itself was new to the pool.
    pub created: bool,
    pub link: AttachOutcome,
}

/// Read-filter over the pool; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub subscription_id: Option<Uuid>,
    pub region: Option<String>,
    pub egress_ip: Option<String>,
    pub tag_keyword: Option<String>,
    pub circuit_open: Option<bool>,
    pub has_outbound: Option<bool>,
    /// Matches nodes whose most recent probe of any kind is at or after
    /// this time.
    pub probed_since_ns: Option<i64>,
}

/// A read view of one node, as returned by list queries.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeView {
    pub hash: String,
    pub created_at_ns: i64,
    pub dynamic: NodeDynamic,
    pub tags: Vec<String>,
    pub subscriptions: Vec<Uuid>,
    pub has_outbound: bool,
}

pub struct NodePool {
    index: RwLock<HashMap<String, Arc<NodeEntry>>>,
    /// egress ip → node hashes, maintained on egress updates.
    egress_index: RwLock<HashMap<String, BTreeSet<String>>>,
    /// Bumped on any mutation that can change a candidate view.
    generation: AtomicU64,
    registry: Arc<SubscriptionRegistry>,
    dirty: Arc<DirtyTracker>,
    config: Arc<ArcSwap<SystemConfig>>,
    clock: Arc<dyn Clock>,
    geo: Arc<dyn GeoLookup>,
    builder: RwLock<Option<Arc<dyn OutboundBuilder>>>,
    lease_probe: RwLock<Option<LeaseProbe>>,
    /// When wired, spawned transport builds hold in-flight guards so
    /// shutdown can drain them.
    shutdown: RwLock<Option<Arc<ShutdownController>>>,
    /// Back-reference for the spawned transport-build hook.
    self_ref: RwLock<Weak<NodePool>>,
}

impl NodePool {
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        dirty: Arc<DirtyTracker>,
        config: Arc<ArcSwap<SystemConfig>>,
        clock: Arc<dyn Clock>,
        geo: Arc<dyn GeoLookup>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            index: RwLock::new(HashMap::new()),
            egress_index: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            registry,
            dirty,
            config,
            clock,
            geo,
            builder: RwLock::new(None),
            lease_probe: RwLock::new(None),
            shutdown: RwLock::new(None),
            self_ref: RwLock::new(Weak::new()),
        });
        *pool.self_ref.write() = Arc::downgrade(&pool);
        pool
    }

    /// Wires the outbound-transport builder. Nodes added before this stay
    /// non-candidates until [`Self::prepare_outbound`] runs for them.
    pub fn set_builder(&self, builder: Arc<dyn OutboundBuilder>) {
        *self.builder.write() = Some(builder);
    }

    /// Wires the lease-liveness probe (backed by the routing engine).
    pub fn set_lease_probe(&self, probe: LeaseProbe) {
        *self.lease_probe.write() = Some(probe);
    }

    /// Wires the shutdown controller so spawned transport builds count as
    /// in-flight operations.
    pub fn set_shutdown(&self, controller: Arc<ShutdownController>) {
        *self.shutdown.write() = Some(controller);
    }

    /// Current pool generation; candidate views cache against it.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    fn node_has_live_lease(&self, hash: &str) -> bool {
        let probe = self.lease_probe.read().clone();
        probe.is_some_and(|probe| probe(hash))
    }

    // -----------------------------------------------------------------------
    // Add / remove
    // -----------------------------------------------------------------------

    /// Adds a node on behalf of a subscription, idempotently.
    ///
    /// A new hash creates static + dynamic entries and (when a builder is
    /// wired) kicks off asynchronous transport construction; the node is not
    /// routable until that completes. An existing hash only attaches the
    /// subscription reference, leaving dynamic state untouched.
    ///
    /// # Errors
    ///
    /// `NotFound` if the subscription is not registered.
    pub fn add_from_subscription(
        &self,
        raw_options: Vec<u8>,
        subscription_id: &Uuid,
        tags: Vec<String>,
    ) -> Result<AddOutcome> {
        let hash = node_hash(&raw_options);

        let link = self
            .registry
            .attach(subscription_id, &hash, tags)
            .ok_or_else(|| Error::not_found(format!("subscription {subscription_id}")))?;
        if link.changed() {
            self.dirty
                .subscription_nodes
                .mark_upsert((*subscription_id, hash.clone()));
        }

        let created = {
            let mut index = self.index.write();
            if index.contains_key(&hash) {
                false
            } else {
                let statics = NodeStatic {
                    hash: hash.clone(),
                    raw_options,
                    created_at_ns: self.clock.now_ns(),
                };
                index.insert(
                    hash.clone(),
                    Arc::new(NodeEntry::new(statics, NodeDynamic::default())),
                );
                true
            }
        };

        if created {
            self.dirty.nodes_static.mark_upsert(hash.clone());
            self.dirty.nodes_dynamic.mark_upsert(hash.clone());
            self.bump_generation();
            debug!(%hash, %subscription_id, "node added to pool");

            if self.builder.read().is_some() {
                if let Some(pool) = self.self_ref.read().upgrade() {
                    let spawn_hash = hash.clone();
                    let guard = self
                        .shutdown
                        .read()
                        .as_ref()
                        .map(|controller| controller.in_flight_guard());
                    tokio::spawn(async move {
                        let _guard = guard;
                        if let Err(e) = pool.prepare_outbound(&spawn_hash).await {
                            warn!(hash = %spawn_hash, error = %e, "outbound build failed");
                        }
                    });
                }
            }
        }

        Ok(AddOutcome {
            hash,
            created,
            link,
        })
    }

    /// Builds (or rebuilds) the node's outbound transport via the wired
    /// builder. Safe to retry after a failed build.
    ///
    /// # Errors
    ///
    /// `Unavailable` when no builder is wired, `NotFound` for an unknown
    /// node, `Internal` when the builder fails.
    pub async fn prepare_outbound(&self, hash: &str) -> Result<()> {
        let builder = self
            .builder
            .read()
            .clone()
            .ok_or_else(|| Error::unavailable("outbound builder not wired"))?;
        let raw_options = self
            .get(hash)
            .ok_or_else(|| Error::not_found(format!("node {hash}")))?
            .statics()
            .raw_options
            .clone();

        let transport = builder
            .build(&raw_options)
            .await
            .map_err(|e| Error::internal(format!("outbound build for {hash}: {e}")))?;

        // The node may have been removed while the build suspended.
        if let Some(entry) = self.get(hash) {
            entry.set_outbound(transport);
            self.bump_generation();
            debug!(%hash, "outbound transport ready");
        }
        Ok(())
    }

    /// Detaches a subscription reference.
    ///
    /// Ephemeral subscriptions defer the detach: the link is marked evicted
    /// and the node survives until the evict delay elapses or its leases
    /// end (see [`Self::reap_evicted`]). Otherwise the link is dropped and
    /// the node is deleted once nothing references it and no live lease
    /// points at it.
    ///
    /// # Errors
    ///
    /// `NotFound` if the subscription or the link does not exist.
    pub fn remove_from_subscription(&self, hash: &str, subscription_id: &Uuid) -> Result<()> {
        let entry = self
            .registry
            .get(subscription_id)
            .ok_or_else(|| Error::not_found(format!("subscription {subscription_id}")))?;
        let spec = entry.spec();
        if entry.link(hash).is_none() {
            return Err(Error::not_found(format!(
                "node {hash} is not managed by subscription {subscription_id}"
            )));
        }

        if spec.ephemeral && spec.ephemeral_node_evict_delay_ns > 0 {
            if self
                .registry
                .mark_evicted(subscription_id, hash, self.clock.now_ns())
            {
                self.dirty
                    .subscription_nodes
                    .mark_upsert((*subscription_id, hash.to_string()));
            }
            return Ok(());
        }

        self.registry.detach(subscription_id, hash);
        self.dirty
            .subscription_nodes
            .mark_delete((*subscription_id, hash.to_string()));
        self.maybe_delete_node(hash);
        Ok(())
    }

    /// Finalizes evicted links. A link finalizes when its evict delay has
    /// elapsed (the node goes even with a live lease; the lease dies on its
    /// next lookup) or earlier once no live lease points at the node.
    /// Returns how many links were finalized.
    pub fn reap_evicted(&self, now_ns: i64) -> usize {
        let mut reaped = 0;
        for (subscription_id, hash, evicted_at_ns, delay_ns) in self.registry.evicted_links() {
            let deadline_passed = now_ns >= evicted_at_ns.saturating_add(delay_ns);
            if !deadline_passed && self.node_has_live_lease(&hash) {
                continue;
            }
            self.registry.detach(&subscription_id, &hash);
            self.dirty
                .subscription_nodes
                .mark_delete((subscription_id, hash.clone()));
            self.delete_node_if_unreferenced(&hash, !deadline_passed);
            reaped += 1;
        }
        reaped
    }

    /// Detaches every link of a subscription immediately. Used when the
    /// subscription itself is deleted: the evicted-row retention does not
    /// apply, because the intent to re-add died with the subscription.
    pub fn purge_subscription(&self, subscription_id: &Uuid) -> usize {
        let Some(entry) = self.registry.get(subscription_id) else {
            return 0;
        };
        let hashes: Vec<String> = entry.managed().keys().cloned().collect();
        for hash in &hashes {
            self.registry.detach(subscription_id, hash);
            self.dirty
                .subscription_nodes
                .mark_delete((*subscription_id, hash.clone()));
            self.maybe_delete_node(hash);
        }
        hashes.len()
    }

    /// Deletes the node if nothing references it and no live lease points at
    /// it. Returns whether the node was deleted.
    fn maybe_delete_node(&self, hash: &str) -> bool {
        self.delete_node_if_unreferenced(hash, true)
    }

    fn delete_node_if_unreferenced(&self, hash: &str, respect_leases: bool) -> bool {
        if !self.registry.refs_for_node(hash).is_empty() {
            return false;
        }
        // Lease liveness is probed before taking the index write lock; the
        // probe walks the lease table.
        if respect_leases && self.node_has_live_lease(hash) {
            return false;
        }

        let Some(entry) = self.index.write().remove(hash) else {
            return false;
        };

        if let Some(ip) = entry.egress_ip() {
            let mut egress = self.egress_index.write();
            if let Some(set) = egress.get_mut(&ip) {
                set.remove(hash);
                if set.is_empty() {
                    egress.remove(&ip);
                }
            }
        }

        for bucket in entry.latency_buckets() {
            self.dirty
                .node_latency
                .mark_delete((hash.to_string(), bucket));
        }
        self.dirty.nodes_dynamic.mark_delete(hash.to_string());
        self.dirty.nodes_static.mark_delete(hash.to_string());
        self.bump_generation();
        info!(%hash, "node removed from pool");
        // Dropping the entry releases its transport.
        drop(entry);
        true
    }

    // -----------------------------------------------------------------------
    // Dynamic-state operations
    // -----------------------------------------------------------------------

    /// Resets the failure streak and closes the circuit. Returns `false`
    /// for an unknown node.
    pub fn record_success(&self, hash: &str) -> bool {
        let Some(entry) = self.get(hash) else {
            return false;
        };
        let was_open = entry.with_dynamic(|d| {
            let was_open = d.circuit_open();
            d.record_success();
            was_open
        });
        self.dirty.nodes_dynamic.mark_upsert(hash.to_string());
        if was_open {
            self.bump_generation();
            info!(%hash, "circuit closed after success");
        }
        true
    }

    /// Counts a failure; opens the circuit at the configured streak.
    /// Returns `false` for an unknown node.
    pub fn record_failure(&self, hash: &str) -> bool {
        let Some(entry) = self.get(hash) else {
            return false;
        };
        let max = self.config.load().max_consecutive_failures;
        let now = self.clock.now_ns();
        let opened = entry.with_dynamic(|d| d.record_failure(now, max));
        self.dirty.nodes_dynamic.mark_upsert(hash.to_string());
        if opened {
            self.bump_generation();
            metrics::counter!("resin_circuit_opened_total").increment(1);
            warn!(%hash, "circuit opened after consecutive failures");
        }
        true
    }

    /// Updates egress attribution from a probe result, resolving the region
    /// through the GeoIP capability.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown node.
    pub fn update_egress_ip(&self, hash: &str, ip: &str) -> Result<()> {
        let entry = self
            .get(hash)
            .ok_or_else(|| Error::not_found(format!("node {hash}")))?;

        let mut region = self.geo.region(ip);
        if !is_region_code(&region) {
            warn!(%hash, %region, "geo lookup returned a non-region code");
            region = String::new();
        }

        let now = self.clock.now_ns();
        let old_ip = entry.with_dynamic(|d| {
            let old = d.egress_ip.clone();
            d.set_egress(ip.to_string(), region, now);
            old
        });

        {
            let mut egress = self.egress_index.write();
            if let Some(old_ip) = old_ip {
                if let Some(set) = egress.get_mut(&old_ip) {
                    set.remove(hash);
                    if set.is_empty() {
                        egress.remove(&old_ip);
                    }
                }
            }
            egress
                .entry(ip.to_string())
                .or_default()
                .insert(hash.to_string());
        }

        self.dirty.nodes_dynamic.mark_upsert(hash.to_string());
        self.bump_generation();
        Ok(())
    }

    /// Folds a latency observation into the node's table.
    ///
    /// The observation always feeds the wildcard bucket; authorities in the
    /// configured set additionally keep their own bucket. Returns `false`
    /// for an unknown node.
    pub fn record_latency(&self, hash: &str, authority: &str, observed_ns: i64) -> bool {
        let Some(entry) = self.get(hash) else {
            return false;
        };
        let config = self.config.load_full();
        let bucket = config.authority_bucket(authority).to_string();
        let now = self.clock.now_ns();

        entry.with_latency(|table| {
            table.observe(
                "",
                observed_ns,
                now,
                config.latency_decay_window_ns,
                config.max_latency_table_entries,
            );
            if !bucket.is_empty() {
                table.observe(
                    &bucket,
                    observed_ns,
                    now,
                    config.latency_decay_window_ns,
                    config.max_latency_table_entries,
                );
            }
        });
        entry.with_dynamic(|d| {
            d.last_latency_probe_at_ns = now;
            if !bucket.is_empty() {
                d.last_authority_probe_at_ns = now;
            }
        });

        self.dirty
            .node_latency
            .mark_upsert((hash.to_string(), String::new()));
        if !bucket.is_empty() {
            self.dirty
                .node_latency
                .mark_upsert((hash.to_string(), bucket));
        }
        self.dirty.nodes_dynamic.mark_upsert(hash.to_string());
        true
    }

    // -----------------------------------------------------------------------
    // Read queries
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn get(&self, hash: &str) -> Option<Arc<NodeEntry>> {
        self.index.read().get(hash).cloned()
    }

    #[must_use]
    pub fn contains(&self, hash: &str) -> bool {
        self.index.read().contains_key(hash)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Snapshot of every entry.
    #[must_use]
    pub fn entries(&self) -> Vec<Arc<NodeEntry>> {
        self.index.read().values().cloned().collect()
    }

    /// Hashes of nodes whose egress is the given IP.
    #[must_use]
    pub fn nodes_by_egress(&self, ip: &str) -> Vec<String> {
        self.egress_index
            .read()
            .get(ip)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of nodes with an open circuit.
    #[must_use]
    pub fn circuit_open_count(&self) -> usize {
        self.entries().iter().filter(|e| e.circuit_open()).count()
    }

    /// Hashes of pooled nodes that still lack a prepared transport.
    #[must_use]
    pub fn hashes_without_outbound(&self) -> Vec<String> {
        self.entries()
            .iter()
            .filter(|e| !e.has_outbound())
            .map(|e| e.hash().to_string())
            .collect()
    }

    /// Read view of one node.
    #[must_use]
    pub fn view(&self, hash: &str) -> Option<NodeView> {
        let entry = self.get(hash)?;
        let refs = self.registry.refs_for_node(hash);
        Some(NodeView {
            hash: hash.to_string(),
            created_at_ns: entry.statics().created_at_ns,
            dynamic: entry.dynamic(),
            tags: self.registry.tags_for_node(hash),
            subscriptions: refs.into_iter().map(|(id, _)| id).collect(),
            has_outbound: entry.has_outbound(),
        })
    }

    /// Filtered node listing, sorted by hash.
    ///
    /// `platform_candidates`, when given, restricts the listing to a
    /// platform's current candidate set (resolved by the caller).
    #[must_use]
    pub fn list(
        &self,
        filter: &NodeFilter,
        platform_candidates: Option<&HashSet<String>>,
    ) -> Vec<NodeView> {
        let mut views: Vec<NodeView> = self
            .entries()
            .into_iter()
            .filter_map(|entry| {
                let hash = entry.hash().to_string();
                if let Some(allowed) = platform_candidates {
                    if !allowed.contains(&hash) {
                        return None;
                    }
                }

                let refs = self.registry.refs_for_node(&hash);
                if let Some(subscription_id) = &filter.subscription_id {
                    if !refs.iter().any(|(id, _)| id == subscription_id) {
                        return None;
                    }
                }

                let dynamic = entry.dynamic();
                if let Some(region) = &filter.region {
                    if &dynamic.egress_region != region {
                        return None;
                    }
                }
                if let Some(egress_ip) = &filter.egress_ip {
                    if dynamic.egress_ip.as_deref() != Some(egress_ip.as_str()) {
                        return None;
                    }
                }
                if let Some(circuit_open) = filter.circuit_open {
                    if dynamic.circuit_open() != circuit_open {
                        return None;
                    }
                }
                let has_outbound = entry.has_outbound();
                if let Some(wanted) = filter.has_outbound {
                    if has_outbound != wanted {
                        return None;
                    }
                }
                if let Some(since) = filter.probed_since_ns {
                    let last_probe = dynamic
                        .last_latency_probe_at_ns
                        .max(dynamic.last_authority_probe_at_ns)
                        .max(dynamic.last_egress_probe_at_ns);
                    if last_probe < since {
                        return None;
                    }
                }

                let tags = self.registry.tags_for_node(&hash);
                if let Some(keyword) = &filter.tag_keyword {
                    if !tags.iter().any(|t| t.contains(keyword.as_str())) {
                        return None;
                    }
                }

                Some(NodeView {
                    created_at_ns: entry.statics().created_at_ns,
                    dynamic,
                    tags,
                    subscriptions: refs.into_iter().map(|(id, _)| id).collect(),
                    has_outbound,
                    hash,
                })
            })
            .collect();
        views.sort_by(|a, b| a.hash.cmp(&b.hash));
        views
    }

    // -----------------------------------------------------------------------
    // Boot hydration
    // -----------------------------------------------------------------------

    /// Inserts a persisted node without dirty marks or hooks.
    pub fn hydrate_node(&self, statics: NodeStatic, dynamic: NodeDynamic) {
        let hash = statics.hash.clone();
        if let Some(ip) = dynamic.egress_ip.clone() {
            self.egress_index
                .write()
                .entry(ip)
                .or_default()
                .insert(hash.clone());
        }
        self.index
            .write()
            .insert(hash, Arc::new(NodeEntry::new(statics, dynamic)));
        self.bump_generation();
    }

    /// Restores one persisted latency row.
    pub fn hydrate_latency(&self, hash: &str, domain: String, ewma_ns: f64, last_updated_ns: i64) {
        if let Some(entry) = self.get(hash) {
            entry.with_latency(|table| {
                table.restore(
                    domain,
                    resin_core::LatencyEntry {
                        ewma_ns,
                        last_updated_ns,
                    },
                );
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use resin_core::{
        ManualClock, OutboundTransport, SourceType, SubscriptionSpec, MIN_UPDATE_INTERVAL_NS,
    };

    use super::*;
    use crate::persist::DirtyMark;

    struct FakeTransport;
    impl OutboundTransport for FakeTransport {}

    struct InstantBuilder;

    #[async_trait]
    impl OutboundBuilder for InstantBuilder {
        async fn build(
            &self,
            _raw_options: &[u8],
        ) -> anyhow::Result<Arc<dyn OutboundTransport>> {
            Ok(Arc::new(FakeTransport))
        }
    }

    struct TableGeo;

    impl GeoLookup for TableGeo {
        fn region(&self, ip: &str) -> String {
            if ip.starts_with("203.0.113.") {
                "us".to_string()
            } else {
                String::new()
            }
        }
    }

    struct Harness {
        pool: Arc<NodePool>,
        registry: Arc<SubscriptionRegistry>,
        dirty: Arc<DirtyTracker>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(SubscriptionRegistry::new());
        let dirty = Arc::new(DirtyTracker::new());
        let config = Arc::new(ArcSwap::from_pointee(SystemConfig::default()));
        let clock = Arc::new(ManualClock::new(1_000));
        let pool = NodePool::new(
            Arc::clone(&registry),
            Arc::clone(&dirty),
            config,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::new(TableGeo),
        );
        Harness {
            pool,
            registry,
            dirty,
            clock,
        }
    }

    fn subscription(registry: &SubscriptionRegistry, ephemeral: bool, delay_ns: i64) -> Uuid {
        let sub = SubscriptionSpec {
            name: format!("sub-{}", Uuid::new_v4()),
            source_type: SourceType::Local,
            url: String::new(),
            content: "[]".to_string(),
            update_interval_ns: MIN_UPDATE_INTERVAL_NS,
            enabled: true,
            ephemeral,
            ephemeral_node_evict_delay_ns: delay_ns,
        }
        .into_subscription(Uuid::new_v4(), 0);
        let id = sub.id;
        registry.insert(sub);
        id
    }

    #[tokio::test]
    async fn add_creates_node_and_marks_dirty() {
        let h = harness();
        let sub = subscription(&h.registry, false, 0);

        let outcome = h
            .pool
            .add_from_subscription(b"{\"a\":1}".to_vec(), &sub, vec!["t".to_string()])
            .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.link, AttachOutcome::Created);
        assert!(h.pool.contains(&outcome.hash));

        let statics = h.dirty.nodes_static.drain();
        assert_eq!(statics.get(&outcome.hash), Some(&DirtyMark::Upsert));
        let links = h.dirty.subscription_nodes.drain();
        assert_eq!(
            links.get(&(sub, outcome.hash.clone())),
            Some(&DirtyMark::Upsert)
        );
    }

    #[tokio::test]
    async fn add_existing_hash_attaches_without_touching_dynamic() {
        let h = harness();
        let sub_a = subscription(&h.registry, false, 0);
        let sub_b = subscription(&h.registry, false, 0);

        let first = h
            .pool
            .add_from_subscription(b"{}".to_vec(), &sub_a, vec![])
            .unwrap();
        h.pool.record_failure(&first.hash);

        let second = h
            .pool
            .add_from_subscription(b"{}".to_vec(), &sub_b, vec![])
            .unwrap();
        assert_eq!(second.hash, first.hash);
        assert!(!second.created);
        assert_eq!(h.pool.len(), 1);
        // Failure streak untouched by the re-add.
        assert_eq!(h.pool.get(&first.hash).unwrap().failure_count(), 1);
    }

    #[tokio::test]
    async fn add_for_unknown_subscription_is_not_found() {
        let h = harness();
        let err = h
            .pool
            .add_from_subscription(b"{}".to_vec(), &Uuid::new_v4(), vec![])
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(h.pool.is_empty());
    }

    #[tokio::test]
    async fn prepare_outbound_gates_candidacy() {
        let h = harness();
        let sub = subscription(&h.registry, false, 0);
        h.pool.set_builder(Arc::new(InstantBuilder));

        let outcome = h
            .pool
            .add_from_subscription(b"{}".to_vec(), &sub, vec![])
            .unwrap();
        // The spawned build may still be in flight; force one inline.
        h.pool.prepare_outbound(&outcome.hash).await.unwrap();
        assert!(h.pool.get(&outcome.hash).unwrap().has_outbound());
    }

    #[tokio::test]
    async fn prepare_outbound_without_builder_is_unavailable() {
        let h = harness();
        let sub = subscription(&h.registry, false, 0);
        let outcome = h
            .pool
            .add_from_subscription(b"{}".to_vec(), &sub, vec![])
            .unwrap();
        let err = h.pool.prepare_outbound(&outcome.hash).await.unwrap_err();
        assert_eq!(err.code(), "UNAVAILABLE");
    }

    #[tokio::test]
    async fn failure_streak_opens_circuit_and_bumps_generation() {
        let h = harness();
        let sub = subscription(&h.registry, false, 0);
        let hash = h
            .pool
            .add_from_subscription(b"{}".to_vec(), &sub, vec![])
            .unwrap()
            .hash;

        let before = h.pool.generation();
        h.pool.record_failure(&hash);
        h.pool.record_failure(&hash);
        assert!(!h.pool.get(&hash).unwrap().circuit_open());
        assert_eq!(h.pool.generation(), before);

        h.pool.record_failure(&hash);
        assert!(h.pool.get(&hash).unwrap().circuit_open());
        assert!(h.pool.generation() > before);

        h.pool.record_success(&hash);
        assert!(!h.pool.get(&hash).unwrap().circuit_open());
    }

    #[tokio::test]
    async fn egress_update_maintains_secondary_index() {
        let h = harness();
        let sub = subscription(&h.registry, false, 0);
        let hash = h
            .pool
            .add_from_subscription(b"{}".to_vec(), &sub, vec![])
            .unwrap()
            .hash;

        h.pool.update_egress_ip(&hash, "203.0.113.10").unwrap();
        assert_eq!(h.pool.nodes_by_egress("203.0.113.10"), vec![hash.clone()]);
        let dynamic = h.pool.get(&hash).unwrap().dynamic();
        assert_eq!(dynamic.egress_region, "us");

        h.pool.update_egress_ip(&hash, "198.51.100.7").unwrap();
        assert!(h.pool.nodes_by_egress("203.0.113.10").is_empty());
        assert_eq!(h.pool.nodes_by_egress("198.51.100.7"), vec![hash.clone()]);
        assert_eq!(h.pool.get(&hash).unwrap().dynamic().egress_region, "");
    }

    #[tokio::test]
    async fn latency_feeds_wildcard_and_configured_buckets() {
        let h = harness();
        let sub = subscription(&h.registry, false, 0);
        let hash = h
            .pool
            .add_from_subscription(b"{}".to_vec(), &sub, vec![])
            .unwrap()
            .hash;

        // Unconfigured authority: only the wildcard bucket.
        h.pool.record_latency(&hash, "other.net", 5_000);
        let entry = h.pool.get(&hash).unwrap();
        assert_eq!(entry.ewma(""), Some(5_000.0));
        assert_eq!(entry.ewma("other.net"), None);

        // Configure the authority; now it keeps its own bucket too.
        let config = Arc::new(ArcSwap::from_pointee(SystemConfig {
            authorities: vec!["example.com".to_string()],
            ..SystemConfig::default()
        }));
        let pool2 = NodePool::new(
            Arc::clone(&h.registry),
            Arc::clone(&h.dirty),
            config,
            Arc::clone(&h.clock) as Arc<dyn Clock>,
            Arc::new(TableGeo),
        );
        let hash2 = pool2
            .add_from_subscription(b"{\"b\":2}".to_vec(), &sub, vec![])
            .unwrap()
            .hash;
        pool2.record_latency(&hash2, "example.com", 7_000);
        let entry2 = pool2.get(&hash2).unwrap();
        assert_eq!(entry2.ewma("example.com"), Some(7_000.0));
        assert_eq!(entry2.ewma(""), Some(7_000.0));
    }

    #[tokio::test]
    async fn last_detach_deletes_unleased_node() {
        let h = harness();
        let sub = subscription(&h.registry, false, 0);
        let hash = h
            .pool
            .add_from_subscription(b"{}".to_vec(), &sub, vec![])
            .unwrap()
            .hash;
        let _ = h.dirty.drain_all();

        h.pool.remove_from_subscription(&hash, &sub).unwrap();
        assert!(!h.pool.contains(&hash));

        let statics = h.dirty.nodes_static.drain();
        assert_eq!(statics.get(&hash), Some(&DirtyMark::Delete));
        let dynamics = h.dirty.nodes_dynamic.drain();
        assert_eq!(dynamics.get(&hash), Some(&DirtyMark::Delete));
    }

    #[tokio::test]
    async fn live_lease_defers_deletion() {
        let h = harness();
        let sub = subscription(&h.registry, false, 0);
        let hash = h
            .pool
            .add_from_subscription(b"{}".to_vec(), &sub, vec![])
            .unwrap()
            .hash;
        h.pool.set_lease_probe(Arc::new(|_| true));

        h.pool.remove_from_subscription(&hash, &sub).unwrap();
        // Link is gone but the node survives while the lease lives.
        assert!(h.pool.contains(&hash));
        assert!(h.registry.refs_for_node(&hash).is_empty());
    }

    #[tokio::test]
    async fn ephemeral_detach_marks_evicted_and_reaps_after_deadline() {
        let h = harness();
        let delay = 1_000_000;
        let sub = subscription(&h.registry, true, delay);
        let hash = h
            .pool
            .add_from_subscription(b"{}".to_vec(), &sub, vec![])
            .unwrap()
            .hash;
        h.pool.set_lease_probe(Arc::new(|_| true));

        h.pool.remove_from_subscription(&hash, &sub).unwrap();
        assert!(h.pool.contains(&hash), "evicted node stays pooled");
        assert_eq!(h.registry.evicted_links().len(), 1);

        // Before the deadline, a live lease keeps it.
        assert_eq!(h.pool.reap_evicted(h.clock.now_ns()), 0);
        assert!(h.pool.contains(&hash));

        // After the deadline it goes even with a live lease; the lease dies
        // on its next lookup.
        h.clock.advance(delay + 1);
        assert_eq!(h.pool.reap_evicted(h.clock.now_ns()), 1);
        assert!(h.registry.evicted_links().is_empty());
        assert!(!h.pool.contains(&hash));
    }

    #[tokio::test]
    async fn reap_finalizes_early_when_lease_ends() {
        let h = harness();
        let sub = subscription(&h.registry, true, i64::MAX / 2);
        let hash = h
            .pool
            .add_from_subscription(b"{}".to_vec(), &sub, vec![])
            .unwrap()
            .hash;
        h.pool.set_lease_probe(Arc::new(|_| false));

        h.pool.remove_from_subscription(&hash, &sub).unwrap();
        assert_eq!(h.pool.reap_evicted(h.clock.now_ns()), 1);
        assert!(!h.pool.contains(&hash));
    }

    #[tokio::test]
    async fn revived_node_clears_eviction() {
        let h = harness();
        let sub = subscription(&h.registry, true, 1_000_000);
        let hash = h
            .pool
            .add_from_subscription(b"{}".to_vec(), &sub, vec![])
            .unwrap()
            .hash;

        h.pool.remove_from_subscription(&hash, &sub).unwrap();
        assert!(!h.registry.is_managed(&hash));

        let outcome = h
            .pool
            .add_from_subscription(b"{}".to_vec(), &sub, vec![])
            .unwrap();
        assert!(!outcome.created, "same identity survives eviction window");
        assert_eq!(outcome.link, AttachOutcome::Revived);
        assert!(h.registry.is_managed(&hash));
        assert_eq!(h.pool.reap_evicted(h.clock.now_ns()), 0);
    }

    #[tokio::test]
    async fn list_applies_filters() {
        let h = harness();
        let sub = subscription(&h.registry, false, 0);
        let fast = h
            .pool
            .add_from_subscription(b"{\"n\":1}".to_vec(), &sub, vec!["fast".to_string()])
            .unwrap()
            .hash;
        let slow = h
            .pool
            .add_from_subscription(b"{\"n\":2}".to_vec(), &sub, vec!["slow".to_string()])
            .unwrap()
            .hash;
        h.pool.update_egress_ip(&fast, "203.0.113.10").unwrap();
        for _ in 0..3 {
            h.pool.record_failure(&slow);
        }

        let all = h.pool.list(&NodeFilter::default(), None);
        assert_eq!(all.len(), 2);

        let open = h.pool.list(
            &NodeFilter {
                circuit_open: Some(true),
                ..NodeFilter::default()
            },
            None,
        );
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].hash, slow);

        let tagged = h.pool.list(
            &NodeFilter {
                tag_keyword: Some("fas".to_string()),
                ..NodeFilter::default()
            },
            None,
        );
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].hash, fast);

        let by_region = h.pool.list(
            &NodeFilter {
                region: Some("us".to_string()),
                ..NodeFilter::default()
            },
            None,
        );
        assert_eq!(by_region.len(), 1);
        assert_eq!(by_region[0].hash, fast);

        let restricted: HashSet<String> = [slow.clone()].into_iter().collect();
        let scoped = h.pool.list(&NodeFilter::default(), Some(&restricted));
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].hash, slow);
    }

    #[tokio::test]
    async fn hydrate_restores_without_dirty_marks() {
        let h = harness();
        h.pool.hydrate_node(
            NodeStatic {
                hash: "h1".to_string(),
                raw_options: b"{}".to_vec(),
                created_at_ns: 5,
            },
            NodeDynamic {
                egress_ip: Some("203.0.113.9".to_string()),
                egress_region: "us".to_string(),
                ..NodeDynamic::default()
            },
        );
        h.pool.hydrate_latency("h1", String::new(), 1_500.0, 9);

        assert!(h.pool.contains("h1"));
        assert_eq!(h.pool.nodes_by_egress("203.0.113.9"), vec!["h1".to_string()]);
        assert_eq!(h.pool.get("h1").unwrap().ewma(""), Some(1_500.0));
        assert!(h.dirty.is_empty());
    }
}
