//! The control facade: boot, wiring, CRUD surface, and worker lifecycle.
//!
//! `ControlPlane` is the single object the (out-of-scope) API layer and data
//! plane consume. Opening it runs the full boot sequence -- open and migrate
//! both stores, repair orphans, hydrate the pool, registry, and lease table,
//! ensure the `DEFAULT` platform and the config singleton -- and `start`
//! spawns the four background workers (flush, scheduler, lease sweeper,
//! metrics sampler), all cancelled through one shutdown signal.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use resin_core::{
    default_platform_spec, AccountHeaderRule, Clock, Error, Fetcher, GeoLookup, Lease,
    OutboundBuilder, Platform, PlatformSpec, RequestFinished, RequestObserver, Result, RuleTable,
    Subscription, SubscriptionSpec, SystemClock, SystemConfig, DEFAULT_PLATFORM_NAME,
};

use crate::fetch::HttpFetcher;
use crate::persist::{
    repair, DirtyTracker, FlushEngine, FlushOutcome, FlushWorker, LatencyRow, StorePaths,
    StrongStore, SubscriptionNodeRow, WeakReaders, WeakStore,
};
use crate::platforms::PlatformDirectory;
use crate::pool::{compute_candidates, NodeFilter, NodePool, NodeView, PlatformRuntime};
use crate::routing::{RouteError, RoutingEngine};
use crate::shutdown::{RunState, ShutdownController};
use crate::subscription::{SubscriptionRegistry, SubscriptionRuntime, SubscriptionScheduler};

/// GeoIP fallback reporting every region as unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullGeoLookup;

impl GeoLookup for NullGeoLookup {
    fn region(&self, _ip: &str) -> String {
        String::new()
    }
}

/// The injected capability set.
///
/// The outbound builder is optional: without one, nodes stay pooled but
/// never become candidates (useful for a control plane booted ahead of its
/// data plane).
pub struct Collaborators {
    pub builder: Option<Arc<dyn OutboundBuilder>>,
    pub fetcher: Arc<dyn Fetcher>,
    pub geo: Arc<dyn GeoLookup>,
    pub clock: Arc<dyn Clock>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            builder: None,
            fetcher: Arc::new(HttpFetcher::new()),
            geo: Arc::new(NullGeoLookup),
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct ControlPlane {
    config: Arc<ArcSwap<SystemConfig>>,
    strong: Arc<StrongStore>,
    weak: Arc<WeakStore>,
    dirty: Arc<DirtyTracker>,
    registry: Arc<SubscriptionRegistry>,
    platforms: Arc<PlatformDirectory>,
    pool: Arc<NodePool>,
    routing: Arc<RoutingEngine>,
    scheduler: Arc<SubscriptionScheduler>,
    flush: Arc<FlushEngine>,
    rules: ArcSwap<RuleTable>,
    shutdown: Arc<ShutdownController>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl ControlPlane {
    /// Opens both stores and runs the boot sequence.
    ///
    /// # Errors
    ///
    /// `Internal` on store open/migration/repair failures.
    pub fn open(paths: &StorePaths, collaborators: Collaborators) -> Result<Arc<Self>> {
        let strong = Arc::new(StrongStore::open(&paths.strong)?);
        let weak = Arc::new(WeakStore::open(&paths.weak)?);
        Self::boot(strong, weak, collaborators)
    }

    /// In-memory variant for tests: same boot sequence, no files.
    ///
    /// # Errors
    ///
    /// As for [`Self::open`].
    pub fn open_memory(collaborators: Collaborators) -> Result<Arc<Self>> {
        let strong = Arc::new(StrongStore::open_memory()?);
        let weak = Arc::new(WeakStore::open_memory()?);
        Self::boot(strong, weak, collaborators)
    }

    fn boot(
        strong: Arc<StrongStore>,
        weak: Arc<WeakStore>,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>> {
        let clock = Arc::clone(&collaborators.clock);
        let shutdown = Arc::new(ShutdownController::new());

        // Config singleton: load or persist defaults.
        let config_record = match strong.load_config()? {
            Some(config) => config,
            None => {
                let config = SystemConfig::default();
                strong.save_config(&config, clock.now_ns())?;
                config
            }
        };
        let config = Arc::new(ArcSwap::from_pointee(config_record));

        // Strong-side state.
        let platform_records = strong.list_platforms()?;
        let subscription_records = strong.list_subscriptions()?;

        // Cross-store orphan repair before anything hydrates.
        let platform_ids: HashSet<Uuid> = platform_records.iter().map(|p| p.id).collect();
        let subscription_ids: HashSet<Uuid> =
            subscription_records.iter().map(|s| s.id).collect();
        repair(&weak, &platform_ids, &subscription_ids)?;

        let registry = Arc::new(SubscriptionRegistry::new());
        for subscription in subscription_records {
            registry.insert(subscription);
        }

        let dirty = Arc::new(DirtyTracker::new());
        let pool = NodePool::new(
            Arc::clone(&registry),
            Arc::clone(&dirty),
            Arc::clone(&config),
            Arc::clone(&clock),
            Arc::clone(&collaborators.geo),
        );
        if let Some(builder) = collaborators.builder {
            pool.set_builder(builder);
        }
        pool.set_shutdown(Arc::clone(&shutdown));

        let platforms = Arc::new(PlatformDirectory::new());
        for platform in platform_records {
            platforms.upsert(platform)?;
        }
        if !platforms.contains_name(DEFAULT_PLATFORM_NAME) {
            let spec = default_platform_spec(config.load().default_sticky_ttl_ns);
            let platform = spec.into_platform(Uuid::new_v4(), clock.now_ns());
            strong.insert_platform(&platform)?;
            platforms.upsert(platform)?;
        }

        let routing = Arc::new(RoutingEngine::new(
            Arc::clone(&pool),
            Arc::clone(&platforms),
            Arc::clone(&registry),
            Arc::clone(&dirty),
            Arc::clone(&config),
            Arc::clone(&clock),
        ));
        let probe_target = Arc::downgrade(&routing);
        pool.set_lease_probe(Arc::new(move |hash| {
            probe_target
                .upgrade()
                .is_some_and(|routing| routing.node_has_live_lease(hash))
        }));

        // Weak-side hydration (post-repair rows only).
        let load = weak.load_all()?;
        for link in load.links {
            registry.hydrate_link(
                &link.subscription_id,
                link.node_hash,
                link.tags,
                link.evicted,
            );
        }
        let mut dynamics: std::collections::HashMap<String, resin_core::NodeDynamic> =
            load.dynamics.into_iter().collect();
        for statics in load.statics {
            let dynamic = dynamics.remove(&statics.hash).unwrap_or_default();
            pool.hydrate_node(statics, dynamic);
        }
        for row in load.latency {
            pool.hydrate_latency(&row.node_hash, row.domain, row.ewma_ns, row.last_updated_ns);
        }
        routing.hydrate(load.leases);

        let rules = ArcSwap::from_pointee(RuleTable::new(strong.list_rules()?));

        let readers = Self::weak_readers(&pool, &routing, &registry);
        let flush = Arc::new(FlushEngine::new(
            Arc::clone(&dirty),
            readers,
            Arc::clone(&weak) as Arc<dyn crate::persist::BatchSink>,
        ));

        let scheduler = Arc::new(SubscriptionScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            collaborators.fetcher,
            Arc::clone(&config),
            Arc::clone(&clock),
        ));

        info!(
            platforms = platforms.len(),
            subscriptions = registry.len(),
            nodes = pool.len(),
            "control plane booted"
        );

        Ok(Arc::new(Self {
            config,
            strong,
            weak,
            dirty,
            registry,
            platforms,
            pool,
            routing,
            scheduler,
            flush,
            rules,
            shutdown,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            clock,
        }))
    }

    fn weak_readers(
        pool: &Arc<NodePool>,
        routing: &Arc<RoutingEngine>,
        registry: &Arc<SubscriptionRegistry>,
    ) -> WeakReaders {
        WeakReaders {
            node_static: {
                let pool = Arc::clone(pool);
                Box::new(move |hash| pool.get(hash).map(|entry| entry.statics().clone()))
            },
            node_dynamic: {
                let pool = Arc::clone(pool);
                Box::new(move |hash| pool.get(hash).map(|entry| entry.dynamic()))
            },
            node_latency: {
                let pool = Arc::clone(pool);
                Box::new(move |hash, domain| {
                    pool.get(hash)
                        .and_then(|entry| entry.latency_entry(domain))
                        .map(|latency| LatencyRow {
                            node_hash: hash.to_string(),
                            domain: domain.to_string(),
                            ewma_ns: latency.ewma_ns,
                            last_updated_ns: latency.last_updated_ns,
                        })
                })
            },
            lease: {
                let routing = Arc::clone(routing);
                Box::new(move |platform_id, account| routing.get_lease(platform_id, account))
            },
            subscription_node: {
                let registry = Arc::clone(registry);
                Box::new(move |subscription_id, hash| {
                    registry
                        .get(subscription_id)
                        .and_then(|entry| entry.link(hash))
                        .map(|state| SubscriptionNodeRow {
                            subscription_id: *subscription_id,
                            node_hash: hash.to_string(),
                            tags: state.tags,
                            evicted: state.evicted,
                        })
                })
            },
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawns the background workers. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut workers = self.workers.lock();

        let flush_worker = FlushWorker::new(
            Arc::clone(&self.flush),
            Arc::clone(&self.config),
            Arc::clone(&self.clock),
        );
        workers.push(tokio::spawn(
            flush_worker.run(self.shutdown.shutdown_receiver()),
        ));

        workers.push(tokio::spawn(
            Arc::clone(&self.scheduler).run(Arc::clone(&self.shutdown)),
        ));

        workers.push(tokio::spawn(Self::lease_sweeper(
            Arc::clone(&self.routing),
            Arc::clone(&self.pool),
            Arc::clone(&self.config),
            Arc::clone(&self.clock),
            self.shutdown.shutdown_receiver(),
        )));

        workers.push(tokio::spawn(Self::metrics_sampler(
            Arc::clone(&self.pool),
            Arc::clone(&self.routing),
            Arc::clone(&self.dirty),
            Arc::clone(&self.config),
            Arc::clone(&self.shutdown),
        )));

        // Rebuild transports for hydrated nodes; the builds are in-flight
        // operations like any other.
        for hash in self.pool.hashes_without_outbound() {
            let pool = Arc::clone(&self.pool);
            let guard = self.shutdown.in_flight_guard();
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = pool.prepare_outbound(&hash).await {
                    warn!(%hash, error = %e, "outbound rebuild failed at boot");
                }
            });
        }

        self.shutdown.set_running();
        info!("control plane started");
    }

    /// Signals shutdown, joins every worker, then drains in-flight
    /// operations (facade calls, reconcile cycles, outbound builds); the
    /// flush worker forces a final flush on its way out.
    pub async fn stop(&self) {
        self.shutdown.trigger_shutdown();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
        if !self.shutdown.wait_for_drain(Duration::from_secs(5)).await {
            warn!(
                in_flight = self.shutdown.in_flight_count(),
                "drain timed out; operations still in flight"
            );
        }
        info!("control plane stopped");
    }

    /// Current lifecycle state; the health surface the API layer reports.
    #[must_use]
    pub fn run_state(&self) -> RunState {
        self.shutdown.run_state()
    }

    async fn lease_sweeper(
        routing: Arc<RoutingEngine>,
        pool: Arc<NodePool>,
        config: Arc<ArcSwap<SystemConfig>>,
        clock: Arc<dyn Clock>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let interval_ns = config.load().lease_sweep_interval_ns;
            #[allow(clippy::cast_sign_loss)]
            let interval = Duration::from_nanos(interval_ns.max(1) as u64);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            routing.sweep();
            pool.reap_evicted(clock.now_ns());
        }
    }

    async fn metrics_sampler(
        pool: Arc<NodePool>,
        routing: Arc<RoutingEngine>,
        dirty: Arc<DirtyTracker>,
        config: Arc<ArcSwap<SystemConfig>>,
        shutdown: Arc<ShutdownController>,
    ) {
        let mut signal = shutdown.shutdown_receiver();
        loop {
            let interval_ns = config.load().metrics_sample_interval_ns;
            #[allow(clippy::cast_sign_loss)]
            let interval = Duration::from_nanos(interval_ns.max(1) as u64);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = signal.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *signal.borrow() {
                        break;
                    }
                }
            }
            #[allow(clippy::cast_precision_loss)]
            {
                metrics::gauge!("resin_pool_nodes").set(pool.len() as f64);
                metrics::gauge!("resin_pool_circuit_open").set(pool.circuit_open_count() as f64);
                metrics::gauge!("resin_leases_live").set(routing.live_lease_count() as f64);
                metrics::gauge!("resin_dirty_keys").set(dirty.total() as f64);
                metrics::gauge!("resin_inflight_ops").set(shutdown.in_flight_count() as f64);
            }
        }
    }

    /// Forces one flush cycle outside the worker's cadence.
    ///
    /// # Errors
    ///
    /// `Internal` when the flush transaction aborts (marks are retained).
    pub async fn flush_now(&self) -> Result<()> {
        let _guard = self.shutdown.in_flight_guard();
        let engine = Arc::clone(&self.flush);
        let outcome = tokio::task::spawn_blocking(move || engine.flush_once())
            .await
            .map_err(|e| Error::internal(format!("flush task panicked: {e}")))?;
        match outcome {
            FlushOutcome::Idle | FlushOutcome::Flushed { .. } => Ok(()),
            FlushOutcome::Failed { error } => Err(Error::internal(error)),
        }
    }

    // -----------------------------------------------------------------------
    // Platform CRUD
    // -----------------------------------------------------------------------

    pub fn create_platform(&self, spec: PlatformSpec) -> Result<Platform> {
        spec.validate()?;
        if self.platforms.contains_name(&spec.name) {
            return Err(Error::conflict(format!(
                "platform name {:?} already in use",
                spec.name
            )));
        }
        let platform = spec.into_platform(Uuid::new_v4(), self.clock.now_ns());
        self.strong.insert_platform(&platform)?;
        self.platforms.upsert(platform.clone())?;
        Ok(platform)
    }

    pub fn update_platform(&self, id: &Uuid, spec: PlatformSpec) -> Result<Platform> {
        spec.validate()?;
        let existing = self
            .platforms
            .get(id)
            .ok_or_else(|| Error::not_found(format!("platform {id}")))?;
        if existing.platform.is_reserved() && spec.name != DEFAULT_PLATFORM_NAME {
            return Err(Error::conflict("the DEFAULT platform cannot be renamed"));
        }
        if spec.name != existing.platform.name && self.platforms.contains_name(&spec.name) {
            return Err(Error::conflict(format!(
                "platform name {:?} already in use",
                spec.name
            )));
        }
        let platform = spec.into_platform(*id, self.clock.now_ns());
        self.strong.update_platform(&platform)?;
        self.platforms.upsert(platform.clone())?;
        self.routing.invalidate_candidates(id);
        Ok(platform)
    }

    pub fn delete_platform(&self, id: &Uuid) -> Result<()> {
        let existing = self
            .platforms
            .get(id)
            .ok_or_else(|| Error::not_found(format!("platform {id}")))?;
        if existing.platform.is_reserved() {
            return Err(Error::conflict("the DEFAULT platform cannot be deleted"));
        }
        self.strong.delete_platform(id)?;
        self.platforms.remove(id);
        self.routing.delete_platform_leases(id);
        self.routing.invalidate_candidates(id);
        Ok(())
    }

    pub fn get_platform(&self, id: &Uuid) -> Result<Platform> {
        self.platforms
            .get(id)
            .map(|runtime| runtime.platform.clone())
            .ok_or_else(|| Error::not_found(format!("platform {id}")))
    }

    pub fn get_platform_by_name(&self, name: &str) -> Result<Platform> {
        self.platforms
            .get_by_name(name)
            .map(|runtime| runtime.platform.clone())
            .ok_or_else(|| Error::not_found(format!("platform {name:?}")))
    }

    #[must_use]
    pub fn list_platforms(&self) -> Vec<Platform> {
        self.platforms
            .list()
            .into_iter()
            .map(|runtime| runtime.platform.clone())
            .collect()
    }

    /// The candidate set a hypothetical platform spec would yield, without
    /// touching any cache.
    pub fn preview_filter(
        &self,
        spec: &PlatformSpec,
        platform_id: Option<&Uuid>,
    ) -> Result<Vec<String>> {
        spec.validate()?;
        let id = platform_id.copied().unwrap_or_else(Uuid::new_v4);
        let runtime =
            PlatformRuntime::new(spec.clone().into_platform(id, self.clock.now_ns()))?;
        Ok(compute_candidates(&runtime, &self.pool, &self.registry))
    }

    // -----------------------------------------------------------------------
    // Subscription CRUD
    // -----------------------------------------------------------------------

    pub fn create_subscription(&self, spec: SubscriptionSpec) -> Result<Subscription> {
        spec.validate()?;
        let subscription = spec.into_subscription(Uuid::new_v4(), self.clock.now_ns());
        self.strong.insert_subscription(&subscription)?;
        self.registry.insert(subscription.clone());
        Ok(subscription)
    }

    pub fn update_subscription(&self, id: &Uuid, spec: SubscriptionSpec) -> Result<Subscription> {
        spec.validate()?;
        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| Error::not_found(format!("subscription {id}")))?;
        let created_at_ns = entry.spec().created_at_ns;
        let mut subscription = spec.into_subscription(*id, self.clock.now_ns());
        subscription.created_at_ns = created_at_ns;
        self.strong.update_subscription(&subscription)?;
        entry.set_spec(subscription.clone());
        Ok(subscription)
    }

    /// Deletes a subscription and detaches its nodes immediately (evicted
    /// retention does not apply once the subscription itself is gone).
    pub fn delete_subscription(&self, id: &Uuid) -> Result<()> {
        if self.registry.get(id).is_none() {
            return Err(Error::not_found(format!("subscription {id}")));
        }
        self.strong.delete_subscription(id)?;
        self.pool.purge_subscription(id);
        self.registry.remove(id);
        Ok(())
    }

    pub fn get_subscription(&self, id: &Uuid) -> Result<(Subscription, SubscriptionRuntime)> {
        self.registry
            .get(id)
            .map(|entry| (entry.spec(), entry.runtime()))
            .ok_or_else(|| Error::not_found(format!("subscription {id}")))
    }

    #[must_use]
    pub fn list_subscriptions(&self) -> Vec<(Subscription, SubscriptionRuntime)> {
        self.registry
            .list()
            .into_iter()
            .map(|entry| (entry.spec(), entry.runtime()))
            .collect()
    }

    /// Manual refresh, bypassing the update interval.
    ///
    /// # Errors
    ///
    /// As for [`SubscriptionScheduler::refresh_now`].
    pub async fn refresh_subscription(&self, id: &Uuid) -> Result<()> {
        let _guard = self.shutdown.in_flight_guard();
        self.scheduler.refresh_now(id).await
    }

    // -----------------------------------------------------------------------
    // Account-header rules
    // -----------------------------------------------------------------------

    pub fn upsert_rule(&self, url_prefix: &str, headers: Vec<String>) -> Result<AccountHeaderRule> {
        if url_prefix.trim().is_empty() {
            return Err(Error::invalid("rule prefix must not be empty"));
        }
        let rule = AccountHeaderRule {
            url_prefix: url_prefix.to_string(),
            headers,
            updated_at_ns: self.clock.now_ns(),
        };
        self.strong.upsert_rule(&rule)?;
        self.reload_rules()?;
        Ok(rule)
    }

    pub fn delete_rule(&self, url_prefix: &str) -> Result<()> {
        self.strong.delete_rule(url_prefix)?;
        self.reload_rules()
    }

    pub fn list_rules(&self) -> Result<Vec<AccountHeaderRule>> {
        self.strong.list_rules()
    }

    /// Longest-prefix rule resolution over `host/path`.
    #[must_use]
    pub fn resolve_account_headers(&self, host: &str, path: &str) -> Option<Vec<String>> {
        self.rules.load().resolve(host, path).map(<[String]>::to_vec)
    }

    fn reload_rules(&self) -> Result<()> {
        self.rules
            .store(Arc::new(RuleTable::new(self.strong.list_rules()?)));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Node queries and probes
    // -----------------------------------------------------------------------

    pub fn get_node(&self, hash: &str) -> Result<NodeView> {
        self.pool
            .view(hash)
            .ok_or_else(|| Error::not_found(format!("node {hash}")))
    }

    /// Filtered node listing; `platform_id` scopes it to that platform's
    /// candidate view.
    pub fn list_nodes(
        &self,
        filter: &NodeFilter,
        platform_id: Option<&Uuid>,
    ) -> Result<Vec<NodeView>> {
        let scoped: Option<HashSet<String>> = match platform_id {
            None => None,
            Some(id) => {
                let runtime = self
                    .platforms
                    .get(id)
                    .ok_or_else(|| Error::not_found(format!("platform {id}")))?;
                Some(
                    self.routing
                        .platform_candidates(&runtime)
                        .iter()
                        .cloned()
                        .collect(),
                )
            }
        };
        Ok(self.pool.list(filter, scoped.as_ref()))
    }

    /// Re-invokes the outbound builder for a node whose build failed.
    ///
    /// # Errors
    ///
    /// As for [`NodePool::prepare_outbound`].
    pub async fn retry_outbound(&self, hash: &str) -> Result<()> {
        let _guard = self.shutdown.in_flight_guard();
        self.pool.prepare_outbound(hash).await
    }

    /// Records an egress probe result.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown node.
    pub fn update_node_egress(&self, hash: &str, ip: &str) -> Result<()> {
        self.pool.update_egress_ip(hash, ip)
    }

    // -----------------------------------------------------------------------
    // Routing and leases
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// [`RouteError::NoCandidate`] when nothing is selectable.
    pub fn route(
        &self,
        platform_id: &Uuid,
        account: &str,
        authority: &str,
    ) -> std::result::Result<String, RouteError> {
        let _guard = self.shutdown.in_flight_guard();
        self.routing.route(platform_id, account, authority)
    }

    /// # Errors
    ///
    /// [`RouteError::NoCandidate`] when nothing is selectable or the
    /// platform rejects account-less requests.
    pub fn route_reverse(
        &self,
        platform_id: &Uuid,
        account: Option<&str>,
        authority: &str,
    ) -> std::result::Result<String, RouteError> {
        let _guard = self.shutdown.in_flight_guard();
        self.routing.route_reverse(platform_id, account, authority)
    }

    /// # Errors
    ///
    /// As for [`RoutingEngine::inherit_lease`].
    pub fn inherit_lease(
        &self,
        platform_name: &str,
        parent_account: &str,
        new_account: &str,
    ) -> Result<Lease> {
        let _guard = self.shutdown.in_flight_guard();
        self.routing
            .inherit_lease(platform_name, parent_account, new_account)
    }

    pub fn get_lease(&self, platform_id: &Uuid, account: &str) -> Result<Lease> {
        self.routing
            .get_lease(platform_id, account)
            .ok_or_else(|| Error::not_found(format!("lease ({platform_id}, {account})")))
    }

    #[must_use]
    pub fn list_leases(&self, platform_id: Option<&Uuid>) -> Vec<Lease> {
        self.routing.list_leases(platform_id)
    }

    /// # Errors
    ///
    /// `NotFound` when no such lease exists.
    pub fn delete_lease(&self, platform_id: &Uuid, account: &str) -> Result<()> {
        self.routing.delete_lease(platform_id, account)
    }

    /// Live lease count per egress IP.
    #[must_use]
    pub fn ip_load(&self) -> std::collections::BTreeMap<String, u64> {
        self.routing.ip_load()
    }

    // -----------------------------------------------------------------------
    // System config
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn get_config(&self) -> Arc<SystemConfig> {
        self.config.load_full()
    }

    /// Copy-on-write config update: validates, bumps the version, persists,
    /// then swaps the pointer so readers never see a partial config.
    pub fn update_config(&self, mut new: SystemConfig) -> Result<Arc<SystemConfig>> {
        new.validate()?;
        let current = self.config.load_full();
        new.version = current.version + 1;
        self.strong.save_config(&new, self.clock.now_ns())?;
        let new = Arc::new(new);
        self.config.store(Arc::clone(&new));
        Ok(new)
    }

    // -----------------------------------------------------------------------
    // Component access (data-plane wiring, tests)
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    #[must_use]
    pub fn routing(&self) -> &Arc<RoutingEngine> {
        &self.routing
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn dirty(&self) -> &Arc<DirtyTracker> {
        &self.dirty
    }

    #[must_use]
    pub fn weak_store(&self) -> &Arc<WeakStore> {
        &self.weak
    }
}

impl RequestObserver for ControlPlane {
    /// Health feedback from the data plane: successes close circuits and
    /// feed the latency table, failures advance the breaker.
    fn on_request_finished(&self, event: RequestFinished) {
        let _guard = self.shutdown.in_flight_guard();
        if event.ok {
            self.pool.record_success(&event.node_hash);
            if event.latency_ns > 0 {
                self.pool
                    .record_latency(&event.node_hash, &event.authority, event.latency_ns);
            }
        } else {
            self.pool.record_failure(&event.node_hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use resin_core::{
        MissAction, OutboundTransport, SourceType, MIN_UPDATE_INTERVAL_NS, NANOS_PER_SEC,
    };

    use super::*;

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

    fn collaborators() -> Collaborators {
        Collaborators {
            builder: Some(Arc::new(InstantBuilder)),
            ..Collaborators::default()
        }
    }

    fn platform_spec(name: &str) -> PlatformSpec {
        let mut spec = default_platform_spec(30 * 60 * NANOS_PER_SEC);
        spec.name = name.to_string();
        spec
    }

    fn local_subscription_spec(name: &str, content: &str) -> SubscriptionSpec {
        SubscriptionSpec {
            name: name.to_string(),
            source_type: SourceType::Local,
            url: String::new(),
            content: content.to_string(),
            update_interval_ns: MIN_UPDATE_INTERVAL_NS,
            enabled: true,
            ephemeral: false,
            ephemeral_node_evict_delay_ns: 0,
        }
    }

    #[tokio::test]
    async fn boot_creates_default_platform_and_config() {
        let control = ControlPlane::open_memory(collaborators()).unwrap();

        let default = control.get_platform_by_name(DEFAULT_PLATFORM_NAME).unwrap();
        assert!(default.is_reserved());
        assert_eq!(control.get_config().version, 1);
    }

    #[tokio::test]
    async fn platform_crud_and_reserved_protection() {
        let control = ControlPlane::open_memory(collaborators()).unwrap();

        let platform = control.create_platform(platform_spec("mobile")).unwrap();
        assert_eq!(
            control
                .create_platform(platform_spec("mobile"))
                .unwrap_err()
                .code(),
            "CONFLICT"
        );

        let mut spec = platform.to_spec();
        spec.reverse_proxy_miss_action = MissAction::Reject;
        let updated = control.update_platform(&platform.id, spec).unwrap();
        assert_eq!(updated.reverse_proxy_miss_action, MissAction::Reject);

        // Reserved platform: no rename, no delete.
        let default = control.get_platform_by_name(DEFAULT_PLATFORM_NAME).unwrap();
        let mut renamed = default.to_spec();
        renamed.name = "not-default".to_string();
        assert_eq!(
            control
                .update_platform(&default.id, renamed)
                .unwrap_err()
                .code(),
            "CONFLICT"
        );
        assert_eq!(
            control.delete_platform(&default.id).unwrap_err().code(),
            "CONFLICT"
        );

        control.delete_platform(&platform.id).unwrap();
        assert_eq!(
            control.get_platform(&platform.id).unwrap_err().code(),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn subscription_lifecycle_populates_and_purges_pool() {
        let control = ControlPlane::open_memory(collaborators()).unwrap();

        let sub = control
            .create_subscription(local_subscription_spec(
                "feed",
                r#"[{"server":"a.example"},{"server":"b.example"}]"#,
            ))
            .unwrap();
        control.refresh_subscription(&sub.id).await.unwrap();
        assert_eq!(control.pool().len(), 2);

        // Duplicate name is a conflict surfaced by the strong store.
        assert_eq!(
            control
                .create_subscription(local_subscription_spec("feed", "[]"))
                .unwrap_err()
                .code(),
            "CONFLICT"
        );

        control.delete_subscription(&sub.id).unwrap();
        assert_eq!(control.pool().len(), 0);
        assert_eq!(
            control.get_subscription(&sub.id).unwrap_err().code(),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn route_through_facade_with_default_platform() {
        let control = ControlPlane::open_memory(collaborators()).unwrap();
        let sub = control
            .create_subscription(local_subscription_spec(
                "feed",
                r#"[{"server":"a.example"}]"#,
            ))
            .unwrap();
        control.refresh_subscription(&sub.id).await.unwrap();

        // Ensure the spawned outbound build landed.
        let hash = control.pool().entries()[0].hash().to_string();
        control.retry_outbound(&hash).await.unwrap();

        let default = control.get_platform_by_name(DEFAULT_PLATFORM_NAME).unwrap();
        let node = control
            .route(&default.id, "alice", "example.com")
            .unwrap();
        assert_eq!(node, hash);
        assert_eq!(control.get_lease(&default.id, "alice").unwrap().node_hash, node);
        assert_eq!(control.list_leases(None).len(), 1);
    }

    #[tokio::test]
    async fn request_observer_biases_health() {
        let control = ControlPlane::open_memory(collaborators()).unwrap();
        let sub = control
            .create_subscription(local_subscription_spec(
                "feed",
                r#"[{"server":"a.example"}]"#,
            ))
            .unwrap();
        control.refresh_subscription(&sub.id).await.unwrap();
        let hash = control.pool().entries()[0].hash().to_string();

        let default = control.get_platform_by_name(DEFAULT_PLATFORM_NAME).unwrap();
        for _ in 0..3 {
            control.on_request_finished(RequestFinished {
                platform_id: default.id,
                node_hash: hash.clone(),
                authority: "example.com".to_string(),
                ok: false,
                latency_ns: 0,
            });
        }
        assert!(control.pool().get(&hash).unwrap().circuit_open());

        control.on_request_finished(RequestFinished {
            platform_id: default.id,
            node_hash: hash.clone(),
            authority: "example.com".to_string(),
            ok: true,
            latency_ns: 5_000_000,
        });
        assert!(!control.pool().get(&hash).unwrap().circuit_open());
        assert_eq!(
            control.pool().get(&hash).unwrap().ewma(""),
            Some(5_000_000.0)
        );
    }

    #[tokio::test]
    async fn rules_round_trip_and_resolve() {
        let control = ControlPlane::open_memory(collaborators()).unwrap();

        control
            .upsert_rule("example.com/api/", vec!["X-Api-Account".to_string()])
            .unwrap();
        control
            .upsert_rule("*", vec!["X-Fallback".to_string()])
            .unwrap();
        assert_eq!(
            control
                .upsert_rule("  ", vec![])
                .unwrap_err()
                .code(),
            "INVALID_ARGUMENT"
        );

        assert_eq!(
            control
                .resolve_account_headers("EXAMPLE.com:443", "/api/v1")
                .unwrap(),
            vec!["X-Api-Account".to_string()]
        );
        assert_eq!(
            control
                .resolve_account_headers("other.net", "/")
                .unwrap(),
            vec!["X-Fallback".to_string()]
        );

        control.delete_rule("*").unwrap();
        assert!(control.resolve_account_headers("other.net", "/").is_none());
    }

    #[tokio::test]
    async fn preview_filter_reports_hypothetical_candidates() {
        let control = ControlPlane::open_memory(collaborators()).unwrap();
        let sub = control
            .create_subscription(local_subscription_spec(
                "feed",
                r#"[{"server":"a.example","tag":"premium-1"},{"server":"b.example","tag":"basic"}]"#,
            ))
            .unwrap();
        control.refresh_subscription(&sub.id).await.unwrap();
        for hash in control.pool().hashes_without_outbound() {
            control.retry_outbound(&hash).await.unwrap();
        }

        let mut spec = platform_spec("preview");
        spec.regex_filters = vec!["^premium-".to_string()];
        let candidates = control.preview_filter(&spec, None).unwrap();
        assert_eq!(candidates.len(), 1);

        let open = control.preview_filter(&platform_spec("all"), None).unwrap();
        assert_eq!(open.len(), 2);
    }

    #[tokio::test]
    async fn config_update_bumps_version_and_persists() {
        let control = ControlPlane::open_memory(collaborators()).unwrap();

        let mut new = SystemConfig::clone(&control.get_config());
        new.max_consecutive_failures = 7;
        let updated = control.update_config(new).unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.max_consecutive_failures, 7);

        let mut bad = SystemConfig::clone(&control.get_config());
        bad.flush_dirty_threshold = 0;
        assert_eq!(
            control.update_config(bad).unwrap_err().code(),
            "INVALID_ARGUMENT"
        );
    }

    #[tokio::test]
    async fn start_and_stop_lifecycle() {
        let control = ControlPlane::open_memory(collaborators()).unwrap();
        assert_eq!(control.run_state(), RunState::Starting);

        control.start();
        control.start(); // idempotent
        assert_eq!(control.run_state(), RunState::Running);

        control.stop().await;
        assert_eq!(control.run_state(), RunState::Stopped);
    }

    /// A fetcher slow enough that its cycle is still in flight when stop()
    /// begins draining.
    struct SlowFetcher;

    #[async_trait]
    impl resin_core::Fetcher for SlowFetcher {
        async fn fetch(
            &self,
            _url: &str,
            _user_agent: &str,
            _timeout: Duration,
        ) -> anyhow::Result<Vec<u8>> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(br#"[{"server":"slow.example"}]"#.to_vec())
        }
    }

    #[tokio::test]
    async fn stop_drains_in_flight_operations() {
        let control = ControlPlane::open_memory(Collaborators {
            builder: Some(Arc::new(InstantBuilder)),
            fetcher: Arc::new(SlowFetcher),
            ..Collaborators::default()
        })
        .unwrap();
        control.start();

        let sub = control
            .create_subscription(SubscriptionSpec {
                name: "slow".to_string(),
                source_type: SourceType::Remote,
                url: "https://feed.example.com/slow".to_string(),
                content: String::new(),
                update_interval_ns: MIN_UPDATE_INTERVAL_NS,
                enabled: true,
                ephemeral: false,
                ephemeral_node_evict_delay_ns: 0,
            })
            .unwrap();

        let refresher = Arc::clone(&control);
        let id = sub.id;
        let refresh = tokio::spawn(async move { refresher.refresh_subscription(&id).await });
        // Let the cycle get in flight before shutting down.
        tokio::time::sleep(Duration::from_millis(10)).await;

        control.stop().await;

        // stop() waited out the guarded cycle: the fetched node landed
        // before the drain completed.
        assert_eq!(control.run_state(), RunState::Stopped);
        assert_eq!(control.pool().len(), 1);
        refresh.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn state_survives_restart_via_flush_and_hydration() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::in_dir(dir.path());

        let platform_id;
        let sub_id;
        let node_hash;
        {
            let control = ControlPlane::open(&paths, collaborators()).unwrap();
            let platform = control.create_platform(platform_spec("mobile")).unwrap();
            platform_id = platform.id;
            let sub = control
                .create_subscription(local_subscription_spec(
                    "feed",
                    r#"[{"server":"a.example"}]"#,
                ))
                .unwrap();
            sub_id = sub.id;
            control.refresh_subscription(&sub.id).await.unwrap();
            node_hash = control.pool().entries()[0].hash().to_string();
            control.retry_outbound(&node_hash).await.unwrap();
            control.route(&platform_id, "alice", "").unwrap();
            control.flush_now().await.unwrap();
        }

        let control = ControlPlane::open(&paths, collaborators()).unwrap();
        assert_eq!(control.get_platform(&platform_id).unwrap().name, "mobile");
        assert!(control.get_subscription(&sub_id).is_ok());
        assert!(control.pool().contains(&node_hash));
        let lease = control.get_lease(&platform_id, "alice").unwrap();
        assert_eq!(lease.node_hash, node_hash);
        assert!(control.registry().is_managed(&node_hash));
    }
}
