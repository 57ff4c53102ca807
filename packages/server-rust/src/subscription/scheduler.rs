//! The subscription scheduler: periodic fetch, diff, and reconciliation.
//!
//! One cooperative cycle per enabled subscription, driven by a single
//! scheduler tick. Fetches run on a bounded worker pool (semaphore); cycles
//! are non-reentrant per subscription. The diff-then-apply step is fully
//! synchronous, so a cancelled cycle never leaves a partial pool mutation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use resin_core::{Clock, Error, Fetcher, Result, SourceType, SystemConfig};

use crate::pool::NodePool;
use crate::shutdown::ShutdownController;

use super::parser::{parse_outbounds, ParsedOutbound};
use super::{SubscriptionEntry, SubscriptionRegistry};

pub struct SubscriptionScheduler {
    registry: Arc<SubscriptionRegistry>,
    pool: Arc<NodePool>,
    fetcher: Arc<dyn Fetcher>,
    config: Arc<ArcSwap<SystemConfig>>,
    clock: Arc<dyn Clock>,
    /// Bounds concurrent fetches; excess subscriptions wait their turn.
    fetch_slots: Arc<Semaphore>,
}

impl SubscriptionScheduler {
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        pool: Arc<NodePool>,
        fetcher: Arc<dyn Fetcher>,
        config: Arc<ArcSwap<SystemConfig>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let slots = config.load().scheduler_fetch_concurrency.max(1);
        Self {
            registry,
            pool,
            fetcher,
            config,
            clock,
            fetch_slots: Arc::new(Semaphore::new(slots)),
        }
    }

    /// The scheduler task: ticks, finds due subscriptions, and spawns their
    /// cycles onto the bounded worker pool. Each spawned cycle holds an
    /// in-flight guard so shutdown drains running reconciles.
    pub async fn run(self: Arc<Self>, shutdown: Arc<ShutdownController>) {
        info!("subscription scheduler started");
        let mut signal = shutdown.shutdown_receiver();
        loop {
            let tick_ns = self.config.load().scheduler_tick_ns;
            #[allow(clippy::cast_sign_loss)]
            let tick = Duration::from_nanos(tick_ns.max(1) as u64);

            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                changed = signal.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *signal.borrow() {
                        break;
                    }
                }
            }

            let now = self.clock.now_ns();
            for entry in self.registry.list() {
                if shutdown.is_shutting_down() {
                    break;
                }
                let spec = entry.spec();
                if !spec.enabled {
                    continue;
                }
                if now - entry.runtime().last_checked_ns < spec.update_interval_ns {
                    continue;
                }
                let scheduler = Arc::clone(&self);
                let id = spec.id;
                let guard = shutdown.in_flight_guard();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = scheduler.run_cycle(&id, false).await {
                        debug!(subscription = %id, error = %e, "scheduled refresh failed");
                    }
                });
            }
        }
        info!("subscription scheduler stopped");
    }

    /// Manual refresh: bypasses the interval check but is otherwise one
    /// ordinary cycle.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown subscription, `Unavailable` when a cycle is
    /// already in flight or the fetch fails, `InvalidArgument` for an
    /// unparseable payload.
    pub async fn refresh_now(&self, id: &Uuid) -> Result<()> {
        self.run_cycle(id, true).await
    }

    async fn run_cycle(&self, id: &Uuid, force: bool) -> Result<()> {
        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| Error::not_found(format!("subscription {id}")))?;
        if !entry.try_begin_refresh() {
            return Err(Error::unavailable(format!(
                "subscription {id} refresh already in progress"
            )));
        }
        let result = self.cycle(&entry, id, force).await;
        entry.end_refresh();
        result
    }

    async fn cycle(&self, entry: &SubscriptionEntry, id: &Uuid, force: bool) -> Result<()> {
        let spec = entry.spec();
        let config = self.config.load_full();

        if !force {
            let elapsed = self.clock.now_ns() - entry.runtime().last_checked_ns;
            if elapsed < spec.update_interval_ns {
                return Ok(());
            }
        }

        // Fetch under a bounded slot; local content short-circuits.
        let fetched: anyhow::Result<Vec<u8>> = match spec.source_type {
            SourceType::Remote => {
                let _slot = self
                    .fetch_slots
                    .acquire()
                    .await
                    .map_err(|_| Error::unavailable("scheduler is shutting down"))?;
                #[allow(clippy::cast_sign_loss)]
                let timeout = Duration::from_nanos(config.resource_fetch_timeout_ns.max(0) as u64);
                self.fetcher.fetch(&spec.url, &config.user_agent, timeout).await
            }
            SourceType::Local => Ok(spec.content.clone().into_bytes()),
        };

        // last_checked advances regardless of outcome.
        let checked_at = self.clock.now_ns();
        entry.with_runtime(|r| r.last_checked_ns = checked_at);

        let payload = match fetched {
            Ok(payload) => payload,
            Err(e) => {
                warn!(subscription = %spec.name, error = %e, "subscription fetch failed");
                metrics::counter!("resin_subscription_refresh_failed_total").increment(1);
                entry.with_runtime(|r| r.last_error = Some(e.to_string()));
                return Err(Error::unavailable(format!(
                    "fetch for subscription {id} failed: {e}"
                )));
            }
        };

        let parsed = match parse_outbounds(&payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(subscription = %spec.name, error = %e, "subscription payload unparseable");
                metrics::counter!("resin_subscription_refresh_failed_total").increment(1);
                entry.with_runtime(|r| r.last_error = Some(e.to_string()));
                return Err(e);
            }
        };

        let (added, removed) = self.apply(entry, id, parsed);
        if added > 0 || removed > 0 {
            info!(
                subscription = %spec.name,
                added, removed, "subscription reconciled"
            );
        }

        let updated_at = self.clock.now_ns();
        entry.with_runtime(|r| {
            r.last_updated_ns = updated_at;
            r.last_error = None;
        });
        Ok(())
    }

    /// Diff the parsed set against the managed set and apply through the
    /// pool. Synchronous: no suspension between diff and apply.
    fn apply(
        &self,
        entry: &SubscriptionEntry,
        id: &Uuid,
        parsed: Vec<ParsedOutbound>,
    ) -> (usize, usize) {
        let managed = entry.managed();
        let new_hashes: HashSet<&str> = parsed.iter().map(|p| p.hash.as_str()).collect();

        let mut removed = 0;
        for (hash, state) in &managed {
            if state.evicted || new_hashes.contains(hash.as_str()) {
                continue;
            }
            match self.pool.remove_from_subscription(hash, id) {
                Ok(()) => removed += 1,
                Err(e) => warn!(%hash, error = %e, "node removal failed during reconcile"),
            }
        }

        let mut added = 0;
        for outbound in parsed {
            let is_new = !managed.contains_key(&outbound.hash)
                || managed.get(&outbound.hash).is_some_and(|s| s.evicted);
            match self
                .pool
                .add_from_subscription(outbound.raw_options, id, outbound.tags)
            {
                Ok(_) if is_new => added += 1,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "node addition failed during reconcile"),
            }
        }

        (added, removed)
    }
}
