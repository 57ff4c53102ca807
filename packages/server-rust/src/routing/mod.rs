//! The routing engine: sticky leases and power-of-two-choices selection.
//!
//! `route` answers "which node carries this request": a live lease wins,
//! otherwise two random candidates from the platform's view are compared by
//! their latency EWMA against the request authority and the better one gets
//! a fresh lease. The lease table is a `DashMap` keyed by
//! `(platform, account)`; the whole decision for one key runs under that
//! key's entry lock, so consecutive calls observe at most one lease
//! transition and never a superseded node.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use resin_core::{Clock, Error, Lease, LeaseKey, MissAction, Result, SystemConfig};

use crate::persist::DirtyTracker;
use crate::platforms::PlatformDirectory;
use crate::pool::{CandidateCache, NodePool, PlatformRuntime};
use crate::subscription::SubscriptionRegistry;

/// Routing failure. Everything collapses to "no candidate"; health feedback
/// arrives separately through the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no candidate node available")]
    NoCandidate,
}

pub struct RoutingEngine {
    pool: Arc<NodePool>,
    platforms: Arc<PlatformDirectory>,
    registry: Arc<SubscriptionRegistry>,
    candidates: CandidateCache,
    leases: DashMap<LeaseKey, Lease>,
    dirty: Arc<DirtyTracker>,
    config: Arc<ArcSwap<SystemConfig>>,
    clock: Arc<dyn Clock>,
}

impl RoutingEngine {
    #[must_use]
    pub fn new(
        pool: Arc<NodePool>,
        platforms: Arc<PlatformDirectory>,
        registry: Arc<SubscriptionRegistry>,
        dirty: Arc<DirtyTracker>,
        config: Arc<ArcSwap<SystemConfig>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            platforms,
            registry,
            candidates: CandidateCache::new(),
            leases: DashMap::new(),
            dirty,
            config,
            clock,
        }
    }

    // -----------------------------------------------------------------------
    // Route
    // -----------------------------------------------------------------------

    /// Picks the node for `(platform, account)`, preserving affinity.
    ///
    /// 1. A live lease is touched (`last_accessed`, extended expiry) and
    ///    returned.
    /// 2. Otherwise the platform's candidate view feeds P2C selection and
    ///    the winner gets a fresh lease.
    ///
    /// # Errors
    ///
    /// [`RouteError::NoCandidate`] when the platform is unknown or its
    /// candidate view is empty.
    pub fn route(
        &self,
        platform_id: &Uuid,
        account: &str,
        authority: &str,
    ) -> std::result::Result<String, RouteError> {
        metrics::counter!("resin_route_total").increment(1);
        let Some(runtime) = self.platforms.get(platform_id) else {
            return self.no_candidate();
        };
        let now = self.clock.now_ns();
        let key = LeaseKey::new(*platform_id, account);

        // The entry guard serializes all decisions for this key.
        match self.leases.entry(key) {
            Entry::Occupied(mut occupied) => {
                if self.lease_is_live(occupied.get(), now) {
                    let lease = occupied.get_mut();
                    lease.last_accessed_ns = now;
                    lease.expiry_ns = now + runtime.platform.sticky_ttl_ns;
                    let node = lease.node_hash.clone();
                    self.dirty
                        .leases
                        .mark_upsert((*platform_id, account.to_string()));
                    metrics::counter!("resin_route_lease_hits_total").increment(1);
                    return Ok(node);
                }

                match self.select(&runtime, authority) {
                    Some(node) => {
                        let lease = self.make_lease(&runtime, account, &node, now);
                        occupied.insert(lease);
                        self.dirty
                            .leases
                            .mark_upsert((*platform_id, account.to_string()));
                        Ok(node)
                    }
                    None => {
                        occupied.remove();
                        self.dirty
                            .leases
                            .mark_delete((*platform_id, account.to_string()));
                        self.no_candidate()
                    }
                }
            }
            Entry::Vacant(vacant) => match self.select(&runtime, authority) {
                Some(node) => {
                    let lease = self.make_lease(&runtime, account, &node, now);
                    vacant.insert(lease);
                    self.dirty
                        .leases
                        .mark_upsert((*platform_id, account.to_string()));
                    Ok(node)
                }
                None => self.no_candidate(),
            },
        }
    }

    /// Selection without a lease write, for reverse-proxy requests whose
    /// synthetic per-request account carries no affinity.
    ///
    /// # Errors
    ///
    /// [`RouteError::NoCandidate`] as for [`Self::route`].
    pub fn pick_unleased(
        &self,
        platform_id: &Uuid,
        authority: &str,
    ) -> std::result::Result<String, RouteError> {
        metrics::counter!("resin_route_total").increment(1);
        let Some(runtime) = self.platforms.get(platform_id) else {
            return self.no_candidate();
        };
        match self.select(&runtime, authority) {
            Some(node) => Ok(node),
            None => self.no_candidate(),
        }
    }

    /// Routing entry point for reverse-proxy requests, which may arrive
    /// without a resolvable account. `REJECT` platforms refuse those;
    /// `RANDOM` platforms select without writing a lease.
    ///
    /// # Errors
    ///
    /// [`RouteError::NoCandidate`] as for [`Self::route`].
    pub fn route_reverse(
        &self,
        platform_id: &Uuid,
        account: Option<&str>,
        authority: &str,
    ) -> std::result::Result<String, RouteError> {
        match account {
            Some(account) if !account.is_empty() => self.route(platform_id, account, authority),
            _ => {
                let Some(runtime) = self.platforms.get(platform_id) else {
                    return self.no_candidate();
                };
                match runtime.platform.reverse_proxy_miss_action {
                    MissAction::Reject => self.no_candidate(),
                    MissAction::Random => self.pick_unleased(platform_id, authority),
                }
            }
        }
    }

    fn no_candidate(&self) -> std::result::Result<String, RouteError> {
        metrics::counter!("resin_route_no_candidate_total").increment(1);
        Err(RouteError::NoCandidate)
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// P2C: sample two distinct candidates, keep the better-scored one.
    fn select(&self, runtime: &PlatformRuntime, authority: &str) -> Option<String> {
        let candidates = self
            .candidates
            .get_or_build(runtime, &self.pool, &self.registry);
        if candidates.is_empty() {
            return None;
        }

        let config = self.config.load_full();
        let bucket = config.authority_bucket(authority);

        let n = candidates.len();
        let chosen = if n == 1 {
            &candidates[0]
        } else {
            let (i, j) = {
                let mut rng = rand::rng();
                let i = rng.random_range(0..n);
                let j = (i + 1 + rng.random_range(0..n - 1)) % n;
                (i, j)
            };
            self.better(&candidates[i], &candidates[j], bucket)
        };

        // The cached view can lag a removal by one generation bump.
        if self.pool.contains(chosen) {
            Some(chosen.clone())
        } else {
            debug!(node = %chosen, "candidate vanished between view and selection");
            None
        }
    }

    /// Lower EWMA wins; ties break by lower failure count, then hash order.
    fn better<'a>(&self, a: &'a String, b: &'a String, bucket: &str) -> &'a String {
        let (score_a, failures_a) = self.score(a, bucket);
        let (score_b, failures_b) = self.score(b, bucket);
        match score_a.partial_cmp(&score_b) {
            Some(Ordering::Less) => a,
            Some(Ordering::Greater) => b,
            _ => match failures_a.cmp(&failures_b) {
                Ordering::Less => a,
                Ordering::Greater => b,
                Ordering::Equal => {
                    if a <= b {
                        a
                    } else {
                        b
                    }
                }
            },
        }
    }

    /// `(ewma, failure_count)` for a candidate; missing entries compare as
    /// +∞.
    fn score(&self, hash: &str, bucket: &str) -> (f64, u32) {
        match self.pool.get(hash) {
            Some(entry) => (
                entry.ewma(bucket).unwrap_or(f64::INFINITY),
                entry.failure_count(),
            ),
            None => (f64::INFINITY, u32::MAX),
        }
    }

    fn make_lease(
        &self,
        runtime: &PlatformRuntime,
        account: &str,
        node_hash: &str,
        now_ns: i64,
    ) -> Lease {
        let egress_ip = self
            .pool
            .get(node_hash)
            .and_then(|entry| entry.egress_ip())
            .unwrap_or_default();
        Lease {
            platform_id: runtime.platform.id,
            account: account.to_string(),
            node_hash: node_hash.to_string(),
            egress_ip,
            created_at_ns: now_ns,
            expiry_ns: now_ns + runtime.platform.sticky_ttl_ns,
            last_accessed_ns: now_ns,
        }
    }

    /// A lease is live while unexpired, its node pooled, and the node's
    /// circuit closed.
    fn lease_is_live(&self, lease: &Lease, now_ns: i64) -> bool {
        if lease.is_expired(now_ns) {
            return false;
        }
        self.pool
            .get(&lease.node_hash)
            .is_some_and(|entry| !entry.circuit_open())
    }

    // -----------------------------------------------------------------------
    // Inherit
    // -----------------------------------------------------------------------

    /// Atomically copies a live parent lease to a child account: same node,
    /// same egress IP, same expiry.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown platform or a missing/expired parent lease;
    /// `InvalidArgument` when parent and child coincide or the child is
    /// empty.
    pub fn inherit_lease(
        &self,
        platform_name: &str,
        parent_account: &str,
        new_account: &str,
    ) -> Result<Lease> {
        let runtime = self
            .platforms
            .get_by_name(platform_name)
            .ok_or_else(|| Error::not_found(format!("platform {platform_name:?}")))?;
        if parent_account == new_account {
            return Err(Error::invalid("parent and child accounts must differ"));
        }
        if new_account.is_empty() {
            return Err(Error::invalid("child account must not be empty"));
        }

        let platform_id = runtime.platform.id;
        let now = self.clock.now_ns();
        let parent = self
            .leases
            .get(&LeaseKey::new(platform_id, parent_account))
            .map(|lease| lease.clone())
            .ok_or_else(|| {
                Error::not_found(format!("lease ({platform_name}, {parent_account})"))
            })?;
        if !self.lease_is_live(&parent, now) {
            return Err(Error::not_found(format!(
                "lease ({platform_name}, {parent_account}) is no longer live"
            )));
        }

        let child = Lease {
            platform_id,
            account: new_account.to_string(),
            node_hash: parent.node_hash,
            egress_ip: parent.egress_ip,
            created_at_ns: now,
            expiry_ns: parent.expiry_ns,
            last_accessed_ns: now,
        };
        self.leases
            .insert(LeaseKey::new(platform_id, new_account), child.clone());
        self.dirty
            .leases
            .mark_upsert((platform_id, new_account.to_string()));
        Ok(child)
    }

    // -----------------------------------------------------------------------
    // Lease table queries and maintenance
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn get_lease(&self, platform_id: &Uuid, account: &str) -> Option<Lease> {
        self.leases
            .get(&LeaseKey::new(*platform_id, account))
            .map(|lease| lease.clone())
    }

    /// All leases, optionally scoped to one platform, sorted by account.
    #[must_use]
    pub fn list_leases(&self, platform_id: Option<&Uuid>) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self
            .leases
            .iter()
            .filter(|entry| platform_id.is_none_or(|id| &entry.platform_id == id))
            .map(|entry| entry.value().clone())
            .collect();
        leases.sort_by(|a, b| {
            a.platform_id
                .cmp(&b.platform_id)
                .then_with(|| a.account.cmp(&b.account))
        });
        leases
    }

    /// Explicitly drops a lease.
    ///
    /// # Errors
    ///
    /// `NotFound` when no such lease exists.
    pub fn delete_lease(&self, platform_id: &Uuid, account: &str) -> Result<()> {
        let key = LeaseKey::new(*platform_id, account);
        if self.leases.remove(&key).is_none() {
            return Err(Error::not_found(format!("lease ({platform_id}, {account})")));
        }
        self.dirty
            .leases
            .mark_delete((*platform_id, account.to_string()));
        Ok(())
    }

    /// Drops every lease bound to a platform (platform deletion cascade).
    pub fn delete_platform_leases(&self, platform_id: &Uuid) -> usize {
        let keys: Vec<LeaseKey> = self
            .leases
            .iter()
            .filter(|entry| &entry.platform_id == platform_id)
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            self.leases.remove(key);
            self.dirty
                .leases
                .mark_delete((key.platform_id, key.account.clone()));
        }
        keys.len()
    }

    /// Bulk-evicts expired leases and leases whose node left the pool.
    /// Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ns();
        let doomed: Vec<LeaseKey> = self
            .leases
            .iter()
            .filter(|entry| {
                entry.is_expired(now) || !self.pool.contains(&entry.node_hash)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for key in &doomed {
            self.leases.remove(key);
            self.dirty
                .leases
                .mark_delete((key.platform_id, key.account.clone()));
        }
        if !doomed.is_empty() {
            debug!(swept = doomed.len(), "lease sweep evicted stale leases");
        }
        doomed.len()
    }

    /// Whether any unexpired lease points at the node. Consulted by the
    /// pool before deleting a node.
    #[must_use]
    pub fn node_has_live_lease(&self, hash: &str) -> bool {
        let now = self.clock.now_ns();
        self.leases
            .iter()
            .any(|entry| entry.node_hash == hash && !entry.is_expired(now))
    }

    /// Live lease count per egress IP (empty egress excluded).
    #[must_use]
    pub fn ip_load(&self) -> BTreeMap<String, u64> {
        let now = self.clock.now_ns();
        let mut load = BTreeMap::new();
        for entry in &self.leases {
            if entry.is_expired(now) || entry.egress_ip.is_empty() {
                continue;
            }
            *load.entry(entry.egress_ip.clone()).or_insert(0) += 1;
        }
        load
    }

    /// Number of unexpired leases.
    #[must_use]
    pub fn live_lease_count(&self) -> usize {
        let now = self.clock.now_ns();
        self.leases
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    /// Rebuilds the lease table from persisted rows at boot; no dirty marks.
    pub fn hydrate(&self, leases: Vec<Lease>) {
        for lease in leases {
            self.leases.insert(lease.key(), lease);
        }
    }

    /// Drops a platform's cached candidate view.
    pub fn invalidate_candidates(&self, platform_id: &Uuid) {
        self.candidates.invalidate(platform_id);
    }

    /// The platform's current candidate view (cached).
    #[must_use]
    pub fn platform_candidates(&self, runtime: &PlatformRuntime) -> Arc<Vec<String>> {
        self.candidates
            .get_or_build(runtime, &self.pool, &self.registry)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use resin_core::{
        default_platform_spec, GeoLookup, ManualClock, OutboundBuilder, OutboundTransport,
        PlatformSpec, SourceType, SubscriptionSpec, NANOS_PER_SEC, MIN_UPDATE_INTERVAL_NS,
    };

    use super::*;

    const TTL: i64 = 30 * 60 * NANOS_PER_SEC;

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

    struct World {
        pool: Arc<NodePool>,
        registry: Arc<SubscriptionRegistry>,
        platforms: Arc<PlatformDirectory>,
        routing: Arc<RoutingEngine>,
        dirty: Arc<DirtyTracker>,
        clock: Arc<ManualClock>,
        sub: Uuid,
    }

    fn world() -> World {
        let registry = Arc::new(SubscriptionRegistry::new());
        let dirty = Arc::new(DirtyTracker::new());
        let config = Arc::new(ArcSwap::from_pointee(SystemConfig::default()));
        let clock = Arc::new(ManualClock::new(1_000));
        let pool = NodePool::new(
            Arc::clone(&registry),
            Arc::clone(&dirty),
            Arc::clone(&config),
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::new(TableGeo),
        );
        pool.set_builder(Arc::new(InstantBuilder));
        let platforms = Arc::new(PlatformDirectory::new());
        let routing = Arc::new(RoutingEngine::new(
            Arc::clone(&pool),
            Arc::clone(&platforms),
            Arc::clone(&registry),
            Arc::clone(&dirty),
            config,
            Arc::clone(&clock) as Arc<dyn Clock>,
        ));

        let probe_target = Arc::downgrade(&routing);
        pool.set_lease_probe(Arc::new(move |hash| {
            probe_target
                .upgrade()
                .is_some_and(|routing| routing.node_has_live_lease(hash))
        }));

        let sub = SubscriptionSpec {
            name: "feed".to_string(),
            source_type: SourceType::Local,
            url: String::new(),
            content: "[]".to_string(),
            update_interval_ns: MIN_UPDATE_INTERVAL_NS,
            enabled: true,
            ephemeral: false,
            ephemeral_node_evict_delay_ns: 0,
        }
        .into_subscription(Uuid::new_v4(), 0);
        let sub_id = sub.id;
        registry.insert(sub);

        World {
            pool,
            registry,
            platforms,
            routing,
            dirty,
            clock,
            sub: sub_id,
        }
    }

    fn make_platform(w: &World, spec: PlatformSpec) -> Uuid {
        let platform = spec.into_platform(Uuid::new_v4(), 1);
        let id = platform.id;
        w.platforms.upsert(platform).unwrap();
        id
    }

    fn open_platform(w: &World) -> Uuid {
        make_platform(w, default_platform_spec(TTL))
    }

    async fn seed(w: &World, body: &str, egress: Option<&str>) -> String {
        let hash = w
            .pool
            .add_from_subscription(body.as_bytes().to_vec(), &w.sub, vec![])
            .unwrap()
            .hash;
        w.pool.prepare_outbound(&hash).await.unwrap();
        if let Some(ip) = egress {
            w.pool.update_egress_ip(&hash, ip).unwrap();
        }
        hash
    }

    #[tokio::test]
    async fn sticky_hit_touches_and_extends_lease() {
        let w = world();
        let platform = open_platform(&w);
        let node = seed(&w, r#"{"n":1}"#, Some("203.0.113.10")).await;

        let routed = w.routing.route(&platform, "alice", "example.com").unwrap();
        assert_eq!(routed, node);

        let lease = w.routing.get_lease(&platform, "alice").unwrap();
        assert_eq!(lease.node_hash, node);
        assert_eq!(lease.egress_ip, "203.0.113.10");
        assert_eq!(lease.expiry_ns, w.clock.now_ns() + TTL);

        w.clock.advance(NANOS_PER_SEC);
        let routed_again = w.routing.route(&platform, "alice", "example.com").unwrap();
        assert_eq!(routed_again, node);

        let touched = w.routing.get_lease(&platform, "alice").unwrap();
        assert_eq!(touched.last_accessed_ns, w.clock.now_ns());
        assert_eq!(touched.expiry_ns, w.clock.now_ns() + TTL);
        assert!(touched.last_accessed_ns > lease.last_accessed_ns);
        // Still a single row for the (platform, account) pair.
        assert_eq!(w.routing.list_leases(Some(&platform)).len(), 1);
    }

    #[tokio::test]
    async fn unknown_platform_is_no_candidate() {
        let w = world();
        seed(&w, r#"{"n":1}"#, None).await;
        assert_eq!(
            w.routing.route(&Uuid::new_v4(), "alice", ""),
            Err(RouteError::NoCandidate)
        );
    }

    #[tokio::test]
    async fn empty_candidate_view_is_no_candidate() {
        let w = world();
        let platform = open_platform(&w);
        assert_eq!(
            w.routing.route(&platform, "alice", ""),
            Err(RouteError::NoCandidate)
        );
    }

    #[tokio::test]
    async fn open_circuit_excludes_previously_leased_node() {
        let w = world();
        let platform = open_platform(&w);
        let node = seed(&w, r#"{"n":1}"#, None).await;

        assert_eq!(w.routing.route(&platform, "alice", "").unwrap(), node);

        for _ in 0..3 {
            w.pool.record_failure(&node);
        }
        assert_eq!(
            w.routing.route(&platform, "alice", ""),
            Err(RouteError::NoCandidate)
        );
        // The stale lease was dropped with the failed reselect.
        assert!(w.routing.get_lease(&platform, "alice").is_none());
    }

    #[tokio::test]
    async fn lease_on_missing_node_falls_through_to_reselect() {
        let w = world();
        let platform = open_platform(&w);
        let node = seed(&w, r#"{"n":1}"#, None).await;

        // Simulate a restart that hydrated a lease whose node never came
        // back into the pool.
        w.routing.hydrate(vec![Lease {
            platform_id: platform,
            account: "alice".to_string(),
            node_hash: "vanished".to_string(),
            egress_ip: String::new(),
            created_at_ns: 0,
            expiry_ns: i64::MAX,
            last_accessed_ns: 0,
        }]);

        assert_eq!(w.routing.route(&platform, "alice", "").unwrap(), node);
        assert_eq!(
            w.routing.get_lease(&platform, "alice").unwrap().node_hash,
            node
        );
    }

    #[tokio::test]
    async fn p2c_prefers_lower_authority_ewma() {
        let w = world();
        let platform = open_platform(&w);
        let fast = seed(&w, r#"{"n":1}"#, None).await;
        let slow = seed(&w, r#"{"n":2}"#, None).await;

        w.pool.record_latency(&fast, "example.com", 1_000_000);
        w.pool.record_latency(&slow, "example.com", 50_000_000);

        // Two candidates: P2C always compares both, so the fast node wins
        // every fresh selection.
        for i in 0..20 {
            let account = format!("account-{i}");
            let routed = w.routing.route(&platform, &account, "example.com").unwrap();
            assert_eq!(routed, fast, "iteration {i} picked {routed}");
        }
    }

    #[tokio::test]
    async fn missing_ewma_loses_to_any_measurement() {
        let w = world();
        let platform = open_platform(&w);
        let measured = seed(&w, r#"{"n":1}"#, None).await;
        let _unmeasured = seed(&w, r#"{"n":2}"#, None).await;

        w.pool.record_latency(&measured, "example.com", 5_000_000);

        for i in 0..20 {
            let account = format!("account-{i}");
            assert_eq!(
                w.routing.route(&platform, &account, "example.com").unwrap(),
                measured
            );
        }
    }

    #[tokio::test]
    async fn expired_lease_is_lazily_replaced() {
        let w = world();
        let platform = open_platform(&w);
        let node = seed(&w, r#"{"n":1}"#, None).await;

        w.routing.route(&platform, "alice", "").unwrap();
        let first = w.routing.get_lease(&platform, "alice").unwrap();

        w.clock.advance(TTL + 1);
        assert_eq!(w.routing.route(&platform, "alice", "").unwrap(), node);
        let second = w.routing.get_lease(&platform, "alice").unwrap();
        assert!(second.created_at_ns > first.created_at_ns, "fresh lease");
    }

    #[tokio::test]
    async fn inherit_copies_node_egress_and_expiry() {
        let w = world();
        let spec = PlatformSpec {
            name: "mobile".to_string(),
            ..default_platform_spec(TTL)
        };
        let platform = make_platform(&w, spec);
        let node = seed(&w, r#"{"n":1}"#, Some("203.0.113.10")).await;

        w.routing.route(&platform, "parent", "").unwrap();
        let parent = w.routing.get_lease(&platform, "parent").unwrap();

        w.clock.advance(NANOS_PER_SEC);
        let child = w.routing.inherit_lease("mobile", "parent", "child").unwrap();
        assert_eq!(child.node_hash, node);
        assert_eq!(child.egress_ip, parent.egress_ip);
        assert_eq!(child.expiry_ns, parent.expiry_ns);
        assert_eq!(child.created_at_ns, w.clock.now_ns());
        assert_eq!(
            w.routing.get_lease(&platform, "child").unwrap(),
            child
        );
    }

    #[tokio::test]
    async fn inherit_error_cases() {
        let w = world();
        let spec = PlatformSpec {
            name: "mobile".to_string(),
            ..default_platform_spec(TTL)
        };
        let platform = make_platform(&w, spec);
        seed(&w, r#"{"n":1}"#, None).await;

        // Unknown platform.
        assert_eq!(
            w.routing
                .inherit_lease("desktop", "parent", "child")
                .unwrap_err()
                .code(),
            "NOT_FOUND"
        );
        // Missing parent lease.
        assert_eq!(
            w.routing
                .inherit_lease("mobile", "parent", "child")
                .unwrap_err()
                .code(),
            "NOT_FOUND"
        );
        // Same account.
        w.routing.route(&platform, "parent", "").unwrap();
        assert_eq!(
            w.routing
                .inherit_lease("mobile", "parent", "parent")
                .unwrap_err()
                .code(),
            "INVALID_ARGUMENT"
        );
        // Expired parent.
        w.clock.advance(TTL + 1);
        assert_eq!(
            w.routing
                .inherit_lease("mobile", "parent", "child")
                .unwrap_err()
                .code(),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn sweep_evicts_expired_and_orphaned_leases() {
        let w = world();
        let platform = open_platform(&w);
        seed(&w, r#"{"n":1}"#, None).await;

        // Live lease: survives the sweep.
        w.routing.route(&platform, "alice", "").unwrap();

        // Expired lease.
        w.routing.route(&platform, "bob", "").unwrap();
        {
            let key = LeaseKey::new(platform, "bob");
            let mut lease = w.routing.leases.get_mut(&key).unwrap();
            lease.expiry_ns = w.clock.now_ns() - 1;
        }

        // Orphaned lease: its node is not in the pool.
        w.routing.hydrate(vec![Lease {
            platform_id: platform,
            account: "carol".to_string(),
            node_hash: "vanished".to_string(),
            egress_ip: String::new(),
            created_at_ns: 0,
            expiry_ns: i64::MAX,
            last_accessed_ns: 0,
        }]);

        assert_eq!(w.routing.sweep(), 2);
        assert!(w.routing.get_lease(&platform, "alice").is_some());
        assert!(w.routing.get_lease(&platform, "bob").is_none());
        assert!(w.routing.get_lease(&platform, "carol").is_none());
    }

    #[tokio::test]
    async fn ip_load_counts_live_leases_per_egress() {
        let w = world();
        let platform = open_platform(&w);
        seed(&w, r#"{"n":1}"#, Some("203.0.113.10")).await;

        w.routing.route(&platform, "alice", "").unwrap();
        w.routing.route(&platform, "bob", "").unwrap();

        let load = w.routing.ip_load();
        assert_eq!(load.get("203.0.113.10"), Some(&2));
        assert_eq!(w.routing.live_lease_count(), 2);
    }

    #[tokio::test]
    async fn reverse_miss_reject_refuses_and_random_skips_lease() {
        let w = world();
        let reject = make_platform(
            &w,
            PlatformSpec {
                name: "strict".to_string(),
                reverse_proxy_miss_action: MissAction::Reject,
                ..default_platform_spec(TTL)
            },
        );
        let random = make_platform(
            &w,
            PlatformSpec {
                name: "lenient".to_string(),
                ..default_platform_spec(TTL)
            },
        );
        let node = seed(&w, r#"{"n":1}"#, None).await;

        assert_eq!(
            w.routing.route_reverse(&reject, None, ""),
            Err(RouteError::NoCandidate)
        );

        assert_eq!(w.routing.route_reverse(&random, None, "").unwrap(), node);
        assert!(w.routing.list_leases(Some(&random)).is_empty());

        // A resolvable account still routes sticky.
        assert_eq!(
            w.routing
                .route_reverse(&reject, Some("alice"), "")
                .unwrap(),
            node
        );
        assert_eq!(w.routing.list_leases(Some(&reject)).len(), 1);
    }

    #[tokio::test]
    async fn lease_dirty_marks_flow() {
        let w = world();
        let platform = open_platform(&w);
        seed(&w, r#"{"n":1}"#, None).await;
        let _ = w.dirty.drain_all();

        w.routing.route(&platform, "alice", "").unwrap();
        let marks = w.dirty.leases.drain();
        assert_eq!(
            marks.get(&(platform, "alice".to_string())),
            Some(&crate::persist::DirtyMark::Upsert)
        );

        w.routing.delete_lease(&platform, "alice").unwrap();
        let marks = w.dirty.leases.drain();
        assert_eq!(
            marks.get(&(platform, "alice".to_string())),
            Some(&crate::persist::DirtyMark::Delete)
        );
    }
}
