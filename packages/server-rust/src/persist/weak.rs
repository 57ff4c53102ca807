//! The weak store: batch-flushed persistence for high-churn runtime state.
//!
//! Holds `nodes_static`, `nodes_dynamic`, `node_latency`, `leases`, and
//! `subscription_nodes`. Nothing writes here synchronously; the flush worker
//! commits whole [`FlushBatch`]es in one transaction, and boot-time repair
//! runs against the same single-writer connection.

use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use resin_core::{Error, Lease, NodeDynamic, NodeStatic, Result};

use super::flush::FlushBatch;
use super::migrate::{self, column_exists, table_exists, MigrationStep};
use super::strong::{configure, parse_uuid};
use super::map_sql_err;

const STEPS: &[MigrationStep] = &[
    MigrationStep {
        version: 1,
        sql: "
            CREATE TABLE nodes_static (
                hash TEXT PRIMARY KEY,
                raw_options BLOB NOT NULL,
                created_at_ns INTEGER NOT NULL
            );
            CREATE TABLE nodes_dynamic (
                hash TEXT PRIMARY KEY,
                failure_count INTEGER NOT NULL,
                circuit_open_since_ns INTEGER NOT NULL,
                egress_ip TEXT,
                egress_region TEXT NOT NULL,
                egress_updated_at_ns INTEGER NOT NULL,
                last_latency_probe_at_ns INTEGER NOT NULL,
                last_authority_probe_at_ns INTEGER NOT NULL,
                last_egress_probe_at_ns INTEGER NOT NULL
            );
            CREATE TABLE node_latency (
                node_hash TEXT NOT NULL,
                domain TEXT NOT NULL,
                ewma_ns REAL NOT NULL,
                last_updated_ns INTEGER NOT NULL,
                PRIMARY KEY (node_hash, domain)
            );
            CREATE TABLE leases (
                platform_id TEXT NOT NULL,
                account TEXT NOT NULL,
                node_hash TEXT NOT NULL,
                egress_ip TEXT NOT NULL,
                created_at_ns INTEGER NOT NULL,
                expiry_ns INTEGER NOT NULL,
                last_accessed_ns INTEGER NOT NULL,
                PRIMARY KEY (platform_id, account)
            );
            CREATE TABLE subscription_nodes (
                subscription_id TEXT NOT NULL,
                node_hash TEXT NOT NULL,
                tags_json TEXT NOT NULL,
                PRIMARY KEY (subscription_id, node_hash)
            );
        ",
    },
    MigrationStep {
        version: 2,
        sql: "ALTER TABLE subscription_nodes ADD COLUMN evicted INTEGER NOT NULL DEFAULT 0",
    },
];

fn baseline(conn: &Connection) -> rusqlite::Result<i64> {
    if !table_exists(conn, "subscription_nodes")? {
        return Ok(0);
    }
    if column_exists(conn, "subscription_nodes", "evicted")? {
        return Ok(2);
    }
    Ok(1)
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// One `node_latency` row.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyRow {
    pub node_hash: String,
    pub domain: String,
    pub ewma_ns: f64,
    pub last_updated_ns: i64,
}

/// One `subscription_nodes` row: the authoritative "is this node managed"
/// link, with per-node tags.
///
/// `evicted = true` retains the row for an ephemeral node past its reference
/// removal; it records intent to re-add the node if it reappears, and it
/// survives boot repair even when the `nodes_static` row is gone.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionNodeRow {
    pub subscription_id: Uuid,
    pub node_hash: String,
    pub tags: Vec<String>,
    pub evicted: bool,
}

/// Everything the weak store holds, loaded at boot for hydration.
#[derive(Debug, Default)]
pub struct WeakLoad {
    pub statics: Vec<NodeStatic>,
    pub dynamics: Vec<(String, NodeDynamic)>,
    pub latency: Vec<LatencyRow>,
    pub leases: Vec<Lease>,
    pub links: Vec<SubscriptionNodeRow>,
}

// ---------------------------------------------------------------------------
// WeakStore
// ---------------------------------------------------------------------------

/// The weak store. All access goes through the single-writer connection.
pub struct WeakStore {
    conn: Mutex<Connection>,
}

impl WeakStore {
    /// Opens (creating if needed) and migrates the store.
    ///
    /// # Errors
    ///
    /// `Internal` if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(map_sql_err)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    ///
    /// # Errors
    ///
    /// `Internal` on migration failure.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(map_sql_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        configure(&conn).map_err(map_sql_err)?;
        migrate::run(&mut conn, STEPS, baseline, resin_core::now_ns()).map_err(map_sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Commits a flush batch in one transaction.
    ///
    /// Upserts run parents-first (`nodes_static` → `subscription_nodes` →
    /// `nodes_dynamic` → `node_latency` → `leases`), deletes children-first
    /// in the reverse order.
    ///
    /// # Errors
    ///
    /// Any statement or commit failure aborts the whole batch; the caller
    /// merges the drained dirty snapshots back and retries next tick.
    pub fn apply_batch(&self, batch: &FlushBatch) -> anyhow::Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for row in &batch.static_upserts {
            tx.execute(
                "INSERT OR REPLACE INTO nodes_static (hash, raw_options, created_at_ns)
                 VALUES (?1, ?2, ?3)",
                params![row.hash, row.raw_options, row.created_at_ns],
            )?;
        }
        for row in &batch.link_upserts {
            let tags_json = serde_json::to_string(&row.tags)?;
            tx.execute(
                "INSERT OR REPLACE INTO subscription_nodes
                     (subscription_id, node_hash, tags_json, evicted)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    row.subscription_id.to_string(),
                    row.node_hash,
                    tags_json,
                    row.evicted
                ],
            )?;
        }
        for (hash, dynamic) in &batch.dynamic_upserts {
            tx.execute(
                "INSERT OR REPLACE INTO nodes_dynamic (
                     hash, failure_count, circuit_open_since_ns, egress_ip,
                     egress_region, egress_updated_at_ns, last_latency_probe_at_ns,
                     last_authority_probe_at_ns, last_egress_probe_at_ns
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    hash,
                    dynamic.failure_count,
                    dynamic.circuit_open_since_ns,
                    dynamic.egress_ip,
                    dynamic.egress_region,
                    dynamic.egress_updated_at_ns,
                    dynamic.last_latency_probe_at_ns,
                    dynamic.last_authority_probe_at_ns,
                    dynamic.last_egress_probe_at_ns,
                ],
            )?;
        }
        for row in &batch.latency_upserts {
            tx.execute(
                "INSERT OR REPLACE INTO node_latency
                     (node_hash, domain, ewma_ns, last_updated_ns)
                 VALUES (?1, ?2, ?3, ?4)",
                params![row.node_hash, row.domain, row.ewma_ns, row.last_updated_ns],
            )?;
        }
        for lease in &batch.lease_upserts {
            tx.execute(
                "INSERT OR REPLACE INTO leases (
                     platform_id, account, node_hash, egress_ip,
                     created_at_ns, expiry_ns, last_accessed_ns
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    lease.platform_id.to_string(),
                    lease.account,
                    lease.node_hash,
                    lease.egress_ip,
                    lease.created_at_ns,
                    lease.expiry_ns,
                    lease.last_accessed_ns,
                ],
            )?;
        }

        for (platform_id, account) in &batch.lease_deletes {
            tx.execute(
                "DELETE FROM leases WHERE platform_id = ?1 AND account = ?2",
                params![platform_id.to_string(), account],
            )?;
        }
        for (node_hash, domain) in &batch.latency_deletes {
            tx.execute(
                "DELETE FROM node_latency WHERE node_hash = ?1 AND domain = ?2",
                params![node_hash, domain],
            )?;
        }
        for hash in &batch.dynamic_deletes {
            tx.execute("DELETE FROM nodes_dynamic WHERE hash = ?1", params![hash])?;
        }
        for (subscription_id, node_hash) in &batch.link_deletes {
            tx.execute(
                "DELETE FROM subscription_nodes
                 WHERE subscription_id = ?1 AND node_hash = ?2",
                params![subscription_id.to_string(), node_hash],
            )?;
        }
        for hash in &batch.static_deletes {
            tx.execute("DELETE FROM nodes_static WHERE hash = ?1", params![hash])?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Loads every row for boot hydration.
    pub fn load_all(&self) -> Result<WeakLoad> {
        let conn = self.conn.lock();
        let mut load = WeakLoad::default();

        let mut stmt = conn
            .prepare("SELECT hash, raw_options, created_at_ns FROM nodes_static")
            .map_err(map_sql_err)?;
        load.statics = stmt
            .query_map([], |row| {
                Ok(NodeStatic {
                    hash: row.get(0)?,
                    raw_options: row.get(1)?,
                    created_at_ns: row.get(2)?,
                })
            })
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(map_sql_err)?;

        let mut stmt = conn
            .prepare(
                "SELECT hash, failure_count, circuit_open_since_ns, egress_ip,
                        egress_region, egress_updated_at_ns, last_latency_probe_at_ns,
                        last_authority_probe_at_ns, last_egress_probe_at_ns
                 FROM nodes_dynamic",
            )
            .map_err(map_sql_err)?;
        load.dynamics = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    NodeDynamic {
                        failure_count: row.get(1)?,
                        circuit_open_since_ns: row.get(2)?,
                        egress_ip: row.get(3)?,
                        egress_region: row.get(4)?,
                        egress_updated_at_ns: row.get(5)?,
                        last_latency_probe_at_ns: row.get(6)?,
                        last_authority_probe_at_ns: row.get(7)?,
                        last_egress_probe_at_ns: row.get(8)?,
                    },
                ))
            })
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(map_sql_err)?;

        let mut stmt = conn
            .prepare("SELECT node_hash, domain, ewma_ns, last_updated_ns FROM node_latency")
            .map_err(map_sql_err)?;
        load.latency = stmt
            .query_map([], |row| {
                Ok(LatencyRow {
                    node_hash: row.get(0)?,
                    domain: row.get(1)?,
                    ewma_ns: row.get(2)?,
                    last_updated_ns: row.get(3)?,
                })
            })
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(map_sql_err)?;

        let mut stmt = conn
            .prepare(
                "SELECT platform_id, account, node_hash, egress_ip,
                        created_at_ns, expiry_ns, last_accessed_ns
                 FROM leases",
            )
            .map_err(map_sql_err)?;
        let lease_rows: Vec<(String, String, String, String, i64, i64, i64)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(map_sql_err)?;
        load.leases = lease_rows
            .into_iter()
            .map(|(platform_id, account, node_hash, egress_ip, created, expiry, accessed)| {
                Ok(Lease {
                    platform_id: parse_uuid(&platform_id)?,
                    account,
                    node_hash,
                    egress_ip,
                    created_at_ns: created,
                    expiry_ns: expiry,
                    last_accessed_ns: accessed,
                })
            })
            .collect::<Result<_>>()?;

        let mut stmt = conn
            .prepare(
                "SELECT subscription_id, node_hash, tags_json, evicted
                 FROM subscription_nodes",
            )
            .map_err(map_sql_err)?;
        let link_rows: Vec<(String, String, String, bool)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(map_sql_err)?;
        load.links = link_rows
            .into_iter()
            .map(|(subscription_id, node_hash, tags_json, evicted)| {
                Ok(SubscriptionNodeRow {
                    subscription_id: parse_uuid(&subscription_id)?,
                    node_hash,
                    tags: serde_json::from_str(&tags_json)
                        .map_err(|e| Error::internal(format!("corrupt link tags: {e}")))?,
                    evicted,
                })
            })
            .collect::<Result<_>>()?;

        Ok(load)
    }

    // --- Point lookups (tests and repair verification) ---

    pub fn get_node_static(&self, hash: &str) -> Result<Option<NodeStatic>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT hash, raw_options, created_at_ns FROM nodes_static WHERE hash = ?1",
            params![hash],
            |row| {
                Ok(NodeStatic {
                    hash: row.get(0)?,
                    raw_options: row.get(1)?,
                    created_at_ns: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(map_sql_err)
    }

    pub fn get_lease(&self, platform_id: &Uuid, account: &str) -> Result<Option<Lease>> {
        let conn = self.conn.lock();
        let row: Option<(String, String, i64, i64, i64)> = conn
            .query_row(
                "SELECT node_hash, egress_ip, created_at_ns, expiry_ns, last_accessed_ns
                 FROM leases WHERE platform_id = ?1 AND account = ?2",
                params![platform_id.to_string(), account],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()
            .map_err(map_sql_err)?;
        Ok(row.map(|(node_hash, egress_ip, created, expiry, accessed)| Lease {
            platform_id: *platform_id,
            account: account.to_string(),
            node_hash,
            egress_ip,
            created_at_ns: created,
            expiry_ns: expiry,
            last_accessed_ns: accessed,
        }))
    }

    pub fn get_link(
        &self,
        subscription_id: &Uuid,
        node_hash: &str,
    ) -> Result<Option<SubscriptionNodeRow>> {
        let conn = self.conn.lock();
        let row: Option<(String, bool)> = conn
            .query_row(
                "SELECT tags_json, evicted FROM subscription_nodes
                 WHERE subscription_id = ?1 AND node_hash = ?2",
                params![subscription_id.to_string(), node_hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(map_sql_err)?;
        match row {
            None => Ok(None),
            Some((tags_json, evicted)) => Ok(Some(SubscriptionNodeRow {
                subscription_id: *subscription_id,
                node_hash: node_hash.to_string(),
                tags: serde_json::from_str(&tags_json)
                    .map_err(|e| Error::internal(format!("corrupt link tags: {e}")))?,
                evicted,
            })),
        }
    }

    /// Row count of one weak table.
    pub fn table_count(&self, table: WeakTable) -> Result<u64> {
        let sql = match table {
            WeakTable::NodesStatic => "SELECT COUNT(*) FROM nodes_static",
            WeakTable::NodesDynamic => "SELECT COUNT(*) FROM nodes_dynamic",
            WeakTable::NodeLatency => "SELECT COUNT(*) FROM node_latency",
            WeakTable::Leases => "SELECT COUNT(*) FROM leases",
            WeakTable::SubscriptionNodes => "SELECT COUNT(*) FROM subscription_nodes",
        };
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(sql, [], |row| row.get(0)).map_err(map_sql_err)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Names the five weak tables for counting and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakTable {
    NodesStatic,
    NodesDynamic,
    NodeLatency,
    Leases,
    SubscriptionNodes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::flush::FlushBatch;

    fn static_row(hash: &str) -> NodeStatic {
        NodeStatic {
            hash: hash.to_string(),
            raw_options: br#"{"type":"socks"}"#.to_vec(),
            created_at_ns: 1,
        }
    }

    fn lease(platform_id: Uuid, account: &str, node_hash: &str) -> Lease {
        Lease {
            platform_id,
            account: account.to_string(),
            node_hash: node_hash.to_string(),
            egress_ip: "203.0.113.10".to_string(),
            created_at_ns: 1,
            expiry_ns: 100,
            last_accessed_ns: 1,
        }
    }

    #[test]
    fn batch_upserts_then_reads_back() {
        let store = WeakStore::open_memory().unwrap();
        let platform_id = Uuid::new_v4();
        let sub_id = Uuid::new_v4();

        let mut batch = FlushBatch::default();
        batch.static_upserts.push(static_row("h1"));
        batch.dynamic_upserts.push((
            "h1".to_string(),
            NodeDynamic {
                failure_count: 2,
                egress_region: "us".to_string(),
                ..NodeDynamic::default()
            },
        ));
        batch.latency_upserts.push(LatencyRow {
            node_hash: "h1".to_string(),
            domain: "example.com".to_string(),
            ewma_ns: 1_234.5,
            last_updated_ns: 9,
        });
        batch.lease_upserts.push(lease(platform_id, "alice", "h1"));
        batch.link_upserts.push(SubscriptionNodeRow {
            subscription_id: sub_id,
            node_hash: "h1".to_string(),
            tags: vec!["premium".to_string()],
            evicted: false,
        });

        store.apply_batch(&batch).unwrap();

        assert_eq!(store.get_node_static("h1").unwrap().unwrap(), static_row("h1"));
        let loaded_lease = store.get_lease(&platform_id, "alice").unwrap().unwrap();
        assert_eq!(loaded_lease.node_hash, "h1");
        let link = store.get_link(&sub_id, "h1").unwrap().unwrap();
        assert_eq!(link.tags, vec!["premium".to_string()]);
        assert!(!link.evicted);

        let load = store.load_all().unwrap();
        assert_eq!(load.statics.len(), 1);
        assert_eq!(load.dynamics.len(), 1);
        assert_eq!(load.latency.len(), 1);
        assert_eq!(load.leases.len(), 1);
        assert_eq!(load.links.len(), 1);
        assert_eq!(load.dynamics[0].1.failure_count, 2);
        assert!((load.latency[0].ewma_ns - 1_234.5).abs() < 1e-9);
    }

    #[test]
    fn batch_deletes_remove_rows() {
        let store = WeakStore::open_memory().unwrap();
        let platform_id = Uuid::new_v4();
        let sub_id = Uuid::new_v4();

        let mut batch = FlushBatch::default();
        batch.static_upserts.push(static_row("h1"));
        batch.dynamic_upserts.push(("h1".to_string(), NodeDynamic::default()));
        batch.lease_upserts.push(lease(platform_id, "alice", "h1"));
        batch.link_upserts.push(SubscriptionNodeRow {
            subscription_id: sub_id,
            node_hash: "h1".to_string(),
            tags: vec![],
            evicted: false,
        });
        store.apply_batch(&batch).unwrap();

        let mut deletes = FlushBatch::default();
        deletes.lease_deletes.push((platform_id, "alice".to_string()));
        deletes.link_deletes.push((sub_id, "h1".to_string()));
        deletes.dynamic_deletes.push("h1".to_string());
        deletes.static_deletes.push("h1".to_string());
        store.apply_batch(&deletes).unwrap();

        assert_eq!(store.table_count(WeakTable::NodesStatic).unwrap(), 0);
        assert_eq!(store.table_count(WeakTable::NodesDynamic).unwrap(), 0);
        assert_eq!(store.table_count(WeakTable::Leases).unwrap(), 0);
        assert_eq!(store.table_count(WeakTable::SubscriptionNodes).unwrap(), 0);
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let store = WeakStore::open_memory().unwrap();

        let mut batch = FlushBatch::default();
        batch.static_upserts.push(static_row("h1"));
        batch.dynamic_upserts.push(("h1".to_string(), NodeDynamic::default()));
        store.apply_batch(&batch).unwrap();

        let mut batch = FlushBatch::default();
        batch.dynamic_upserts.push((
            "h1".to_string(),
            NodeDynamic {
                failure_count: 5,
                circuit_open_since_ns: 77,
                ..NodeDynamic::default()
            },
        ));
        store.apply_batch(&batch).unwrap();

        let load = store.load_all().unwrap();
        assert_eq!(load.dynamics.len(), 1);
        assert_eq!(load.dynamics[0].1.failure_count, 5);
        assert_eq!(load.dynamics[0].1.circuit_open_since_ns, 77);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let store = WeakStore::open_memory().unwrap();
        store.apply_batch(&FlushBatch::default()).unwrap();
        assert_eq!(store.table_count(WeakTable::NodesStatic).unwrap(), 0);
    }
}
