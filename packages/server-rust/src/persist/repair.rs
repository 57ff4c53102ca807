//! Boot-time consistency repair across the strong/weak boundary.
//!
//! The two stores share no transaction, so a crash can leave weak rows whose
//! parents are gone. Repair runs once at boot, in a single weak-store
//! transaction, deleting orphans in the flush delete order (leases →
//! node_latency → nodes_dynamic → subscription_nodes → nodes_static).
//! `evicted = true` link rows are exempt: they record intent to re-add an
//! ephemeral node and survive even when the node's static row is gone.

use std::collections::HashSet;

use rusqlite::{params, TransactionBehavior};
use tracing::info;
use uuid::Uuid;

use resin_core::Result;

use super::map_sql_err;
use super::weak::WeakStore;

/// Per-table deletion counts of one repair pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub leases_deleted: u64,
    pub latency_deleted: u64,
    pub dynamic_deleted: u64,
    pub links_deleted: u64,
    pub static_deleted: u64,
}

impl RepairReport {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.leases_deleted
            + self.latency_deleted
            + self.dynamic_deleted
            + self.links_deleted
            + self.static_deleted
    }
}

/// Cross-references the weak store against the strong store's parent id sets
/// and deletes every orphan.
///
/// After repair every weak row has a live parent: links point at existing
/// subscriptions and static nodes (unless evicted), static nodes carry at
/// least one non-evicted link, dynamic/latency rows have their static row,
/// and leases have their platform and node.
///
/// # Errors
///
/// `Internal` if the repair transaction fails; no partial deletion is
/// visible in that case.
pub fn repair(
    store: &WeakStore,
    platform_ids: &HashSet<Uuid>,
    subscription_ids: &HashSet<Uuid>,
) -> Result<RepairReport> {
    let platforms: HashSet<String> = platform_ids.iter().map(Uuid::to_string).collect();
    let subscriptions: HashSet<String> = subscription_ids.iter().map(Uuid::to_string).collect();

    let mut conn = store.lock_conn();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(map_sql_err)?;

    // Snapshot the rows the orphan rules cross-reference.
    let static_hashes: HashSet<String> = {
        let mut stmt = tx
            .prepare("SELECT hash FROM nodes_static")
            .map_err(map_sql_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(map_sql_err)?;
        rows
    };
    let links: Vec<(String, String, bool)> = {
        let mut stmt = tx
            .prepare("SELECT subscription_id, node_hash, evicted FROM subscription_nodes")
            .map_err(map_sql_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(map_sql_err)?;
        rows
    };

    // A link is an orphan when its subscription or its node is missing;
    // evicted rows are retained unconditionally.
    let doomed_links: Vec<(String, String)> = links
        .iter()
        .filter(|(sub, hash, evicted)| {
            !*evicted && (!subscriptions.contains(sub) || !static_hashes.contains(hash))
        })
        .map(|(sub, hash, _)| (sub.clone(), hash.clone()))
        .collect();

    // A static node survives only with at least one remaining non-evicted
    // link.
    let referenced: HashSet<&String> = links
        .iter()
        .filter(|(sub, hash, evicted)| {
            !*evicted && subscriptions.contains(sub) && static_hashes.contains(hash)
        })
        .map(|(_, hash, _)| hash)
        .collect();
    let surviving_static: HashSet<String> = static_hashes
        .iter()
        .filter(|hash| referenced.contains(hash))
        .cloned()
        .collect();
    let doomed_static: Vec<String> = static_hashes
        .iter()
        .filter(|hash| !surviving_static.contains(*hash))
        .cloned()
        .collect();

    let mut report = RepairReport::default();

    // Execute in the flush delete order. Child rows are judged against the
    // post-repair static set so nothing is left dangling.
    {
        let mut stmt = tx
            .prepare("SELECT platform_id, account, node_hash FROM leases")
            .map_err(map_sql_err)?;
        let leases: Vec<(String, String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(map_sql_err)?;
        for (platform_id, account, node_hash) in leases {
            if platforms.contains(&platform_id) && surviving_static.contains(&node_hash) {
                continue;
            }
            tx.execute(
                "DELETE FROM leases WHERE platform_id = ?1 AND account = ?2",
                params![platform_id, account],
            )
            .map_err(map_sql_err)?;
            report.leases_deleted += 1;
        }
    }

    {
        let mut stmt = tx
            .prepare("SELECT node_hash, domain FROM node_latency")
            .map_err(map_sql_err)?;
        let entries: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(map_sql_err)?;
        for (node_hash, domain) in entries {
            if surviving_static.contains(&node_hash) {
                continue;
            }
            tx.execute(
                "DELETE FROM node_latency WHERE node_hash = ?1 AND domain = ?2",
                params![node_hash, domain],
            )
            .map_err(map_sql_err)?;
            report.latency_deleted += 1;
        }
    }

    {
        let mut stmt = tx
            .prepare("SELECT hash FROM nodes_dynamic")
            .map_err(map_sql_err)?;
        let hashes: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(map_sql_err)?;
        for hash in hashes {
            if surviving_static.contains(&hash) {
                continue;
            }
            tx.execute("DELETE FROM nodes_dynamic WHERE hash = ?1", params![hash])
                .map_err(map_sql_err)?;
            report.dynamic_deleted += 1;
        }
    }

    for (subscription_id, node_hash) in &doomed_links {
        tx.execute(
            "DELETE FROM subscription_nodes WHERE subscription_id = ?1 AND node_hash = ?2",
            params![subscription_id, node_hash],
        )
        .map_err(map_sql_err)?;
        report.links_deleted += 1;
    }

    for hash in &doomed_static {
        tx.execute("DELETE FROM nodes_static WHERE hash = ?1", params![hash])
            .map_err(map_sql_err)?;
        report.static_deleted += 1;
    }

    tx.commit().map_err(map_sql_err)?;

    if report.total() > 0 {
        info!(
            leases = report.leases_deleted,
            latency = report.latency_deleted,
            dynamic = report.dynamic_deleted,
            links = report.links_deleted,
            statics = report.static_deleted,
            "boot repair removed orphaned weak rows"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use resin_core::{Lease, NodeDynamic, NodeStatic};

    use super::*;
    use crate::persist::flush::FlushBatch;
    use crate::persist::weak::{LatencyRow, SubscriptionNodeRow, WeakTable};

    fn node(hash: &str) -> NodeStatic {
        NodeStatic {
            hash: hash.to_string(),
            raw_options: b"{}".to_vec(),
            created_at_ns: 1,
        }
    }

    fn lease(platform_id: Uuid, account: &str, node_hash: &str) -> Lease {
        Lease {
            platform_id,
            account: account.to_string(),
            node_hash: node_hash.to_string(),
            egress_ip: String::new(),
            created_at_ns: 1,
            expiry_ns: i64::MAX,
            last_accessed_ns: 1,
        }
    }

    fn link(sub: Uuid, hash: &str, evicted: bool) -> SubscriptionNodeRow {
        SubscriptionNodeRow {
            subscription_id: sub,
            node_hash: hash.to_string(),
            tags: vec![],
            evicted,
        }
    }

    #[test]
    fn healthy_rows_survive() {
        let store = WeakStore::open_memory().unwrap();
        let platform = Uuid::new_v4();
        let sub = Uuid::new_v4();

        let mut batch = FlushBatch::default();
        batch.static_upserts.push(node("h1"));
        batch.dynamic_upserts.push(("h1".to_string(), NodeDynamic::default()));
        batch.latency_upserts.push(LatencyRow {
            node_hash: "h1".to_string(),
            domain: String::new(),
            ewma_ns: 1.0,
            last_updated_ns: 1,
        });
        batch.link_upserts.push(link(sub, "h1", false));
        batch.lease_upserts.push(lease(platform, "alice", "h1"));
        store.apply_batch(&batch).unwrap();

        let report = repair(
            &store,
            &HashSet::from([platform]),
            &HashSet::from([sub]),
        )
        .unwrap();

        assert_eq!(report.total(), 0);
        assert_eq!(store.table_count(WeakTable::NodesStatic).unwrap(), 1);
        assert_eq!(store.table_count(WeakTable::Leases).unwrap(), 1);
    }

    #[test]
    fn lease_with_missing_platform_is_deleted_and_evicted_link_survives() {
        let store = WeakStore::open_memory().unwrap();
        let known_platform = Uuid::new_v4();
        let sub = Uuid::new_v4();

        let mut batch = FlushBatch::default();
        batch.static_upserts.push(node("h1"));
        batch.link_upserts.push(link(sub, "h1", false));
        // Lease whose platform does not exist in the strong store.
        batch.lease_upserts.push(lease(Uuid::new_v4(), "alice", "h1"));
        // Evicted link whose nodes_static row is missing.
        batch.link_upserts.push(link(sub, "gone", true));
        store.apply_batch(&batch).unwrap();

        let report = repair(
            &store,
            &HashSet::from([known_platform]),
            &HashSet::from([sub]),
        )
        .unwrap();

        assert_eq!(report.leases_deleted, 1);
        assert_eq!(store.table_count(WeakTable::Leases).unwrap(), 0);
        let evicted = store.get_link(&sub, "gone").unwrap().unwrap();
        assert!(evicted.evicted);
    }

    #[test]
    fn link_with_missing_subscription_is_deleted() {
        let store = WeakStore::open_memory().unwrap();
        let sub = Uuid::new_v4();

        let mut batch = FlushBatch::default();
        batch.static_upserts.push(node("h1"));
        batch.link_upserts.push(link(Uuid::new_v4(), "h1", false));
        store.apply_batch(&batch).unwrap();

        let report = repair(&store, &HashSet::new(), &HashSet::from([sub])).unwrap();

        assert_eq!(report.links_deleted, 1);
        // With its only link gone the static row is an orphan too.
        assert_eq!(report.static_deleted, 1);
        assert_eq!(store.table_count(WeakTable::SubscriptionNodes).unwrap(), 0);
        assert_eq!(store.table_count(WeakTable::NodesStatic).unwrap(), 0);
    }

    #[test]
    fn static_with_only_evicted_refs_is_pruned_with_its_children() {
        let store = WeakStore::open_memory().unwrap();
        let platform = Uuid::new_v4();
        let sub = Uuid::new_v4();

        let mut batch = FlushBatch::default();
        batch.static_upserts.push(node("h1"));
        batch.dynamic_upserts.push(("h1".to_string(), NodeDynamic::default()));
        batch.latency_upserts.push(LatencyRow {
            node_hash: "h1".to_string(),
            domain: "example.com".to_string(),
            ewma_ns: 2.0,
            last_updated_ns: 1,
        });
        batch.link_upserts.push(link(sub, "h1", true));
        batch.lease_upserts.push(lease(platform, "alice", "h1"));
        store.apply_batch(&batch).unwrap();

        let report = repair(
            &store,
            &HashSet::from([platform]),
            &HashSet::from([sub]),
        )
        .unwrap();

        // Static pruned (no non-evicted refs), children judged against the
        // post-repair static set, evicted link retained.
        assert_eq!(report.static_deleted, 1);
        assert_eq!(report.dynamic_deleted, 1);
        assert_eq!(report.latency_deleted, 1);
        assert_eq!(report.leases_deleted, 1);
        assert_eq!(report.links_deleted, 0);
        assert_eq!(store.table_count(WeakTable::SubscriptionNodes).unwrap(), 1);
    }

    #[test]
    fn dynamic_and_latency_orphans_are_deleted() {
        let store = WeakStore::open_memory().unwrap();

        let mut batch = FlushBatch::default();
        batch.dynamic_upserts.push(("ghost".to_string(), NodeDynamic::default()));
        batch.latency_upserts.push(LatencyRow {
            node_hash: "ghost".to_string(),
            domain: String::new(),
            ewma_ns: 3.0,
            last_updated_ns: 1,
        });
        store.apply_batch(&batch).unwrap();

        let report = repair(&store, &HashSet::new(), &HashSet::new()).unwrap();
        assert_eq!(report.dynamic_deleted, 1);
        assert_eq!(report.latency_deleted, 1);
        assert_eq!(store.table_count(WeakTable::NodesDynamic).unwrap(), 0);
        assert_eq!(store.table_count(WeakTable::NodeLatency).unwrap(), 0);
    }
}
