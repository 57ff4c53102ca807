//! The flush protocol: drain dirty sets, read back current values, commit.
//!
//! The flush worker drains every dirty set, resolves each UPSERT mark
//! through reader functions supplied at construction (an UPSERT whose reader
//! finds nothing is reclassified as a DELETE -- the entity was removed
//! between mark and flush), and commits the resulting batch in one weak
//! store transaction. If the transaction aborts, every drained snapshot is
//! merged back so no mark is lost.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use resin_core::{Clock, Lease, NodeDynamic, NodeStatic, SystemConfig};

use super::dirty::{DirtyMark, DirtySnapshots, DirtyTracker};
use super::weak::{LatencyRow, SubscriptionNodeRow, WeakStore};

// ---------------------------------------------------------------------------
// FlushBatch
// ---------------------------------------------------------------------------

/// The materialized writes of one flush, ready for a single transaction.
#[derive(Debug, Default)]
pub struct FlushBatch {
    pub static_upserts: Vec<NodeStatic>,
    pub link_upserts: Vec<SubscriptionNodeRow>,
    pub dynamic_upserts: Vec<(String, NodeDynamic)>,
    pub latency_upserts: Vec<LatencyRow>,
    pub lease_upserts: Vec<Lease>,

    pub static_deletes: Vec<String>,
    pub link_deletes: Vec<(Uuid, String)>,
    pub dynamic_deletes: Vec<String>,
    pub latency_deletes: Vec<(String, String)>,
    pub lease_deletes: Vec<(Uuid, String)>,
}

impl FlushBatch {
    #[must_use]
    pub fn upsert_count(&self) -> usize {
        self.static_upserts.len()
            + self.link_upserts.len()
            + self.dynamic_upserts.len()
            + self.latency_upserts.len()
            + self.lease_upserts.len()
    }

    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.static_deletes.len()
            + self.link_deletes.len()
            + self.dynamic_deletes.len()
            + self.latency_deletes.len()
            + self.lease_deletes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upsert_count() == 0 && self.delete_count() == 0
    }
}

// ---------------------------------------------------------------------------
// WeakReaders
// ---------------------------------------------------------------------------

/// Reader functions resolving a dirty key to the current in-memory value.
///
/// Supplied by the control facade at construction; the flush worker never
/// owns entity state, it mirrors what the readers report at flush time.
pub struct WeakReaders {
    pub node_static: Box<dyn Fn(&str) -> Option<NodeStatic> + Send + Sync>,
    pub node_dynamic: Box<dyn Fn(&str) -> Option<NodeDynamic> + Send + Sync>,
    pub node_latency: Box<dyn Fn(&str, &str) -> Option<LatencyRow> + Send + Sync>,
    pub lease: Box<dyn Fn(&Uuid, &str) -> Option<Lease> + Send + Sync>,
    pub subscription_node: Box<dyn Fn(&Uuid, &str) -> Option<SubscriptionNodeRow> + Send + Sync>,
}

/// Builds the transaction batch from drained snapshots.
///
/// UPSERT marks whose reader returns `None` become deletes.
#[must_use]
pub fn build_batch(snapshots: &DirtySnapshots, readers: &WeakReaders) -> FlushBatch {
    let mut batch = FlushBatch::default();

    for (hash, mark) in &snapshots.nodes_static {
        match mark {
            DirtyMark::Upsert => match (readers.node_static)(hash) {
                Some(row) => batch.static_upserts.push(row),
                None => batch.static_deletes.push(hash.clone()),
            },
            DirtyMark::Delete => batch.static_deletes.push(hash.clone()),
        }
    }
    for (hash, mark) in &snapshots.nodes_dynamic {
        match mark {
            DirtyMark::Upsert => match (readers.node_dynamic)(hash) {
                Some(row) => batch.dynamic_upserts.push((hash.clone(), row)),
                None => batch.dynamic_deletes.push(hash.clone()),
            },
            DirtyMark::Delete => batch.dynamic_deletes.push(hash.clone()),
        }
    }
    for ((hash, domain), mark) in &snapshots.node_latency {
        match mark {
            DirtyMark::Upsert => match (readers.node_latency)(hash, domain) {
                Some(row) => batch.latency_upserts.push(row),
                None => batch.latency_deletes.push((hash.clone(), domain.clone())),
            },
            DirtyMark::Delete => batch.latency_deletes.push((hash.clone(), domain.clone())),
        }
    }
    for ((platform_id, account), mark) in &snapshots.leases {
        match mark {
            DirtyMark::Upsert => match (readers.lease)(platform_id, account) {
                Some(row) => batch.lease_upserts.push(row),
                None => batch.lease_deletes.push((*platform_id, account.clone())),
            },
            DirtyMark::Delete => batch.lease_deletes.push((*platform_id, account.clone())),
        }
    }
    for ((subscription_id, node_hash), mark) in &snapshots.subscription_nodes {
        match mark {
            DirtyMark::Upsert => match (readers.subscription_node)(subscription_id, node_hash) {
                Some(row) => batch.link_upserts.push(row),
                None => batch
                    .link_deletes
                    .push((*subscription_id, node_hash.clone())),
            },
            DirtyMark::Delete => batch
                .link_deletes
                .push((*subscription_id, node_hash.clone())),
        }
    }

    batch
}

// ---------------------------------------------------------------------------
// FlushEngine
// ---------------------------------------------------------------------------

/// Where a flush batch is committed. Implemented by [`WeakStore`]; tests
/// substitute a failing sink to exercise the merge-back path.
pub trait BatchSink: Send + Sync {
    /// Commits the batch atomically.
    ///
    /// # Errors
    ///
    /// Any error aborts the whole batch.
    fn apply_batch(&self, batch: &FlushBatch) -> anyhow::Result<()>;
}

impl BatchSink for WeakStore {
    fn apply_batch(&self, batch: &FlushBatch) -> anyhow::Result<()> {
        WeakStore::apply_batch(self, batch)
    }
}

/// Result of one flush attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was dirty.
    Idle,
    Flushed { upserts: usize, deletes: usize },
    /// The transaction aborted; all marks were merged back.
    Failed { error: String },
}

/// Drain → read-back → commit → (merge-back on failure), as one callable
/// unit shared by the worker tick and forced flushes.
pub struct FlushEngine {
    tracker: Arc<DirtyTracker>,
    readers: WeakReaders,
    sink: Arc<dyn BatchSink>,
}

impl FlushEngine {
    #[must_use]
    pub fn new(tracker: Arc<DirtyTracker>, readers: WeakReaders, sink: Arc<dyn BatchSink>) -> Self {
        Self {
            tracker,
            readers,
            sink,
        }
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<DirtyTracker> {
        &self.tracker
    }

    /// Runs one flush cycle. Blocking (SQLite); call from a blocking
    /// context.
    pub fn flush_once(&self) -> FlushOutcome {
        let snapshots = self.tracker.drain_all();
        if snapshots.is_empty() {
            return FlushOutcome::Idle;
        }

        let batch = build_batch(&snapshots, &self.readers);
        match self.sink.apply_batch(&batch) {
            Ok(()) => {
                metrics::counter!("resin_flush_total").increment(1);
                FlushOutcome::Flushed {
                    upserts: batch.upsert_count(),
                    deletes: batch.delete_count(),
                }
            }
            Err(e) => {
                metrics::counter!("resin_flush_failed_total").increment(1);
                self.tracker.merge_all(snapshots);
                FlushOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FlushWorker
// ---------------------------------------------------------------------------

/// The single background task evaluating the flush triggers.
///
/// On each tick it flushes when `total_dirty >= flush_dirty_threshold` or
/// when `flush_interval_ns` has elapsed since the last flush; an empty dirty
/// state suppresses flushes entirely. On shutdown a final flush is forced.
pub struct FlushWorker {
    engine: Arc<FlushEngine>,
    config: Arc<ArcSwap<SystemConfig>>,
    clock: Arc<dyn Clock>,
}

impl FlushWorker {
    #[must_use]
    pub fn new(
        engine: Arc<FlushEngine>,
        config: Arc<ArcSwap<SystemConfig>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            config,
            clock,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("flush worker started");
        let mut last_flush_ns = self.clock.now_ns();

        loop {
            let tick_ns = self.config.load().flush_tick_ns;
            #[allow(clippy::cast_sign_loss)]
            let tick = Duration::from_nanos(tick_ns.max(1) as u64);

            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            let config = self.config.load_full();
            let total = self.engine.tracker().total();
            metrics::gauge!("resin_dirty_keys").set(usize_to_f64(total));
            if total == 0 {
                continue;
            }

            let now = self.clock.now_ns();
            let interval_elapsed = now - last_flush_ns >= config.flush_interval_ns;
            if total < config.flush_dirty_threshold && !interval_elapsed {
                continue;
            }

            last_flush_ns = now;
            self.flush_blocking().await;
        }

        // Final forced flush so shutdown loses at most what arrives after it.
        if self.engine.tracker().total() > 0 {
            self.flush_blocking().await;
        }
        info!("flush worker stopped");
    }

    async fn flush_blocking(&self) {
        let engine = Arc::clone(&self.engine);
        let outcome = tokio::task::spawn_blocking(move || engine.flush_once()).await;
        match outcome {
            Ok(FlushOutcome::Idle) => {}
            Ok(FlushOutcome::Flushed { upserts, deletes }) => {
                debug!(upserts, deletes, "flushed weak store");
            }
            Ok(FlushOutcome::Failed { error }) => {
                error!(%error, "weak store flush failed; marks retained for retry");
            }
            Err(join_err) => {
                error!(%join_err, "flush task panicked");
            }
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn usize_to_f64(value: usize) -> f64 {
    value as f64
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::persist::weak::WeakTable;

    fn empty_readers() -> WeakReaders {
        WeakReaders {
            node_static: Box::new(|_| None),
            node_dynamic: Box::new(|_| None),
            node_latency: Box::new(|_, _| None),
            lease: Box::new(|_, _| None),
            subscription_node: Box::new(|_, _| None),
        }
    }

    fn static_readers(nodes: Vec<NodeStatic>) -> WeakReaders {
        let table = Arc::new(Mutex::new(
            nodes
                .into_iter()
                .map(|n| (n.hash.clone(), n))
                .collect::<std::collections::HashMap<_, _>>(),
        ));
        let statics = Arc::clone(&table);
        WeakReaders {
            node_static: Box::new(move |hash| statics.lock().get(hash).cloned()),
            node_dynamic: Box::new(|_| Some(NodeDynamic::default())),
            node_latency: Box::new(|_, _| None),
            lease: Box::new(|_, _| None),
            subscription_node: Box::new(|_, _| None),
        }
    }

    fn node(hash: &str) -> NodeStatic {
        NodeStatic {
            hash: hash.to_string(),
            raw_options: b"{}".to_vec(),
            created_at_ns: 1,
        }
    }

    /// Sink that fails while its flag is set.
    struct FlakySink {
        store: WeakStore,
        fail: AtomicBool,
    }

    impl BatchSink for FlakySink {
        fn apply_batch(&self, batch: &FlushBatch) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("simulated transaction abort");
            }
            self.store.apply_batch(batch)
        }
    }

    #[test]
    fn upsert_miss_becomes_delete() {
        let tracker = Arc::new(DirtyTracker::new());
        tracker.nodes_static.mark_upsert("gone".to_string());

        let snapshots = tracker.drain_all();
        let batch = build_batch(&snapshots, &empty_readers());
        assert!(batch.static_upserts.is_empty());
        assert_eq!(batch.static_deletes, vec!["gone".to_string()]);
    }

    #[test]
    fn flush_commits_current_values() {
        let tracker = Arc::new(DirtyTracker::new());
        tracker.nodes_static.mark_upsert("h1".to_string());
        tracker.nodes_dynamic.mark_upsert("h1".to_string());

        let store = Arc::new(WeakStore::open_memory().unwrap());
        let engine = FlushEngine::new(
            Arc::clone(&tracker),
            static_readers(vec![node("h1")]),
            Arc::clone(&store) as Arc<dyn BatchSink>,
        );

        assert_eq!(
            engine.flush_once(),
            FlushOutcome::Flushed {
                upserts: 2,
                deletes: 0
            }
        );
        assert!(tracker.is_empty());
        assert!(store.get_node_static("h1").unwrap().is_some());
    }

    #[test]
    fn empty_tracker_is_idle() {
        let tracker = Arc::new(DirtyTracker::new());
        let store = Arc::new(WeakStore::open_memory().unwrap());
        let engine = FlushEngine::new(
            Arc::clone(&tracker),
            empty_readers(),
            store as Arc<dyn BatchSink>,
        );
        assert_eq!(engine.flush_once(), FlushOutcome::Idle);
    }

    #[test]
    fn failed_flush_preserves_intent_and_retry_succeeds() {
        let tracker = Arc::new(DirtyTracker::new());
        let nodes: Vec<NodeStatic> = (0..5).map(|i| node(&format!("h{i}"))).collect();
        for n in &nodes {
            tracker.nodes_static.mark_upsert(n.hash.clone());
        }
        assert_eq!(tracker.total(), 5);

        let sink = Arc::new(FlakySink {
            store: WeakStore::open_memory().unwrap(),
            fail: AtomicBool::new(true),
        });
        let engine = FlushEngine::new(
            Arc::clone(&tracker),
            static_readers(nodes),
            Arc::clone(&sink) as Arc<dyn BatchSink>,
        );

        // First attempt aborts; all five marks are merged back.
        assert!(matches!(engine.flush_once(), FlushOutcome::Failed { .. }));
        assert_eq!(tracker.total(), 5);

        // Retry succeeds and the store ends with exactly those rows.
        sink.fail.store(false, Ordering::SeqCst);
        assert_eq!(
            engine.flush_once(),
            FlushOutcome::Flushed {
                upserts: 5,
                deletes: 0
            }
        );
        assert!(tracker.is_empty());
        assert_eq!(sink.store.table_count(WeakTable::NodesStatic).unwrap(), 5);
    }

    #[tokio::test]
    async fn worker_forces_final_flush_on_shutdown() {
        let tracker = Arc::new(DirtyTracker::new());
        tracker.nodes_static.mark_upsert("h1".to_string());

        let store = Arc::new(WeakStore::open_memory().unwrap());
        let engine = Arc::new(FlushEngine::new(
            Arc::clone(&tracker),
            static_readers(vec![node("h1")]),
            Arc::clone(&store) as Arc<dyn BatchSink>,
        ));

        let config = Arc::new(ArcSwap::from_pointee(SystemConfig {
            // Long tick and huge threshold: only the shutdown path flushes.
            flush_tick_ns: 3_600 * resin_core::NANOS_PER_SEC,
            flush_dirty_threshold: 1_000_000,
            ..SystemConfig::default()
        }));
        let clock: Arc<dyn Clock> = Arc::new(resin_core::SystemClock);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = FlushWorker::new(Arc::clone(&engine), config, clock);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(tracker.is_empty());
        assert!(store.get_node_static("h1").unwrap().is_some());
    }
}
