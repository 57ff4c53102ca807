//! The strong store: synchronous, transactional persistence for topology.
//!
//! Holds `system_config`, `platforms`, `subscriptions`, and
//! `account_header_rules`. Every write runs in an immediate transaction
//! through the single-writer connection and returns only after commit.
//! Validation happens at the control facade; this layer enforces uniqueness
//! and existence and maps constraint violations onto `Conflict`.

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, TransactionBehavior};
use uuid::Uuid;

use resin_core::{
    AccountHeaderRule, AllocationPolicy, EmptyAccountBehavior, Error, MissAction, Platform,
    Result, SourceType, Subscription, SystemConfig,
};

use super::migrate::{self, column_exists, table_exists, MigrationStep};
use super::map_sql_err;

const STEPS: &[MigrationStep] = &[
    MigrationStep {
        version: 1,
        sql: "
            CREATE TABLE system_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                config_json TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at_ns INTEGER NOT NULL
            );
            CREATE TABLE platforms (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                sticky_ttl_ns INTEGER NOT NULL,
                regex_filters_json TEXT NOT NULL,
                region_filters_json TEXT NOT NULL,
                reverse_proxy_miss_action TEXT NOT NULL,
                reverse_proxy_empty_account_behavior TEXT NOT NULL,
                reverse_proxy_fixed_account_header TEXT NOT NULL,
                updated_at_ns INTEGER NOT NULL
            );
            CREATE TABLE subscriptions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                source_type TEXT NOT NULL,
                url TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                update_interval_ns INTEGER NOT NULL,
                enabled INTEGER NOT NULL,
                ephemeral INTEGER NOT NULL,
                ephemeral_node_evict_delay_ns INTEGER NOT NULL,
                created_at_ns INTEGER NOT NULL,
                updated_at_ns INTEGER NOT NULL
            );
            CREATE TABLE account_header_rules (
                url_prefix TEXT PRIMARY KEY,
                headers_json TEXT NOT NULL,
                updated_at_ns INTEGER NOT NULL
            );
        ",
    },
    MigrationStep {
        version: 2,
        sql: "ALTER TABLE platforms ADD COLUMN allocation_policy TEXT NOT NULL DEFAULT 'BALANCED'",
    },
];

/// Infers the schema version of a database created before the version table
/// existed, by probing for columns introduced in later steps.
fn baseline(conn: &Connection) -> rusqlite::Result<i64> {
    if !table_exists(conn, "platforms")? {
        return Ok(0);
    }
    if column_exists(conn, "platforms", "allocation_policy")? {
        return Ok(2);
    }
    Ok(1)
}

/// The strong store. All access goes through the single-writer connection.
pub struct StrongStore {
    conn: Mutex<Connection>,
}

impl StrongStore {
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

    // --- System config ---

    /// Loads the config singleton, if one has been persisted.
    pub fn load_config(&self) -> Result<Option<SystemConfig>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT config_json, version FROM system_config WHERE id = 1")
            .map_err(map_sql_err)?;
        let mut rows = stmt.query([]).map_err(map_sql_err)?;
        let Some(row) = rows.next().map_err(map_sql_err)? else {
            return Ok(None);
        };
        let json: String = row.get(0).map_err(map_sql_err)?;
        let version: i64 = row.get(1).map_err(map_sql_err)?;

        let mut config: SystemConfig = serde_json::from_str(&json)
            .map_err(|e| Error::internal(format!("corrupt system_config row: {e}")))?;
        config.version = u64::try_from(version).unwrap_or(0);
        Ok(Some(config))
    }

    /// Writes the config singleton.
    pub fn save_config(&self, config: &SystemConfig, now_ns: i64) -> Result<()> {
        let json = serde_json::to_string(config)
            .map_err(|e| Error::internal(format!("encode system config: {e}")))?;
        let version = i64::try_from(config.version).unwrap_or(i64::MAX);

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sql_err)?;
        tx.execute(
            "INSERT INTO system_config (id, config_json, version, updated_at_ns)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET
                 config_json = excluded.config_json,
                 version = excluded.version,
                 updated_at_ns = excluded.updated_at_ns",
            params![json, version, now_ns],
        )
        .map_err(map_sql_err)?;
        tx.commit().map_err(map_sql_err)
    }

    // --- Platforms ---

    pub fn insert_platform(&self, platform: &Platform) -> Result<()> {
        let (regex_filters_json, region_filters_json) = encode_platform_filters(platform)?;
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sql_err)?;
        tx.execute(
            "INSERT INTO platforms (
                 id, name, sticky_ttl_ns, regex_filters_json, region_filters_json,
                 reverse_proxy_miss_action, reverse_proxy_empty_account_behavior,
                 reverse_proxy_fixed_account_header, allocation_policy, updated_at_ns
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                platform.id.to_string(),
                platform.name,
                platform.sticky_ttl_ns,
                regex_filters_json,
                region_filters_json,
                platform.reverse_proxy_miss_action.as_str(),
                platform.reverse_proxy_empty_account_behavior.as_str(),
                platform.reverse_proxy_fixed_account_header,
                platform.allocation_policy.as_str(),
                platform.updated_at_ns,
            ],
        )
        .map_err(map_sql_err)?;
        tx.commit().map_err(map_sql_err)
    }

    pub fn update_platform(&self, platform: &Platform) -> Result<()> {
        let (regex_filters_json, region_filters_json) = encode_platform_filters(platform)?;
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sql_err)?;
        let changed = tx
            .execute(
                "UPDATE platforms SET
                     name = ?2, sticky_ttl_ns = ?3, regex_filters_json = ?4,
                     region_filters_json = ?5, reverse_proxy_miss_action = ?6,
                     reverse_proxy_empty_account_behavior = ?7,
                     reverse_proxy_fixed_account_header = ?8,
                     allocation_policy = ?9, updated_at_ns = ?10
                 WHERE id = ?1",
                params![
                    platform.id.to_string(),
                    platform.name,
                    platform.sticky_ttl_ns,
                    regex_filters_json,
                    region_filters_json,
                    platform.reverse_proxy_miss_action.as_str(),
                    platform.reverse_proxy_empty_account_behavior.as_str(),
                    platform.reverse_proxy_fixed_account_header,
                    platform.allocation_policy.as_str(),
                    platform.updated_at_ns,
                ],
            )
            .map_err(map_sql_err)?;
        if changed == 0 {
            return Err(Error::not_found(format!("platform {}", platform.id)));
        }
        tx.commit().map_err(map_sql_err)
    }

    pub fn delete_platform(&self, id: &Uuid) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sql_err)?;
        let changed = tx
            .execute("DELETE FROM platforms WHERE id = ?1", params![id.to_string()])
            .map_err(map_sql_err)?;
        if changed == 0 {
            return Err(Error::not_found(format!("platform {id}")));
        }
        tx.commit().map_err(map_sql_err)
    }

    pub fn list_platforms(&self) -> Result<Vec<Platform>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, sticky_ttl_ns, regex_filters_json, region_filters_json,
                        reverse_proxy_miss_action, reverse_proxy_empty_account_behavior,
                        reverse_proxy_fixed_account_header, allocation_policy, updated_at_ns
                 FROM platforms ORDER BY name",
            )
            .map_err(map_sql_err)?;
        let raw: Vec<PlatformRow> = stmt
            .query_map([], |row| {
                Ok(PlatformRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    sticky_ttl_ns: row.get(2)?,
                    regex_filters_json: row.get(3)?,
                    region_filters_json: row.get(4)?,
                    miss_action: row.get(5)?,
                    empty_account_behavior: row.get(6)?,
                    fixed_account_header: row.get(7)?,
                    allocation_policy: row.get(8)?,
                    updated_at_ns: row.get(9)?,
                })
            })
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(map_sql_err)?;

        raw.into_iter().map(PlatformRow::into_platform).collect()
    }

    // --- Subscriptions ---

    pub fn insert_subscription(&self, sub: &Subscription) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sql_err)?;
        tx.execute(
            "INSERT INTO subscriptions (
                 id, name, source_type, url, content, update_interval_ns,
                 enabled, ephemeral, ephemeral_node_evict_delay_ns,
                 created_at_ns, updated_at_ns
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                sub.id.to_string(),
                sub.name,
                sub.source_type.as_str(),
                sub.url,
                sub.content,
                sub.update_interval_ns,
                sub.enabled,
                sub.ephemeral,
                sub.ephemeral_node_evict_delay_ns,
                sub.created_at_ns,
                sub.updated_at_ns,
            ],
        )
        .map_err(map_sql_err)?;
        tx.commit().map_err(map_sql_err)
    }

    pub fn update_subscription(&self, sub: &Subscription) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sql_err)?;
        let changed = tx
            .execute(
                "UPDATE subscriptions SET
                     name = ?2, source_type = ?3, url = ?4, content = ?5,
                     update_interval_ns = ?6, enabled = ?7, ephemeral = ?8,
                     ephemeral_node_evict_delay_ns = ?9, updated_at_ns = ?10
                 WHERE id = ?1",
                params![
                    sub.id.to_string(),
                    sub.name,
                    sub.source_type.as_str(),
                    sub.url,
                    sub.content,
                    sub.update_interval_ns,
                    sub.enabled,
                    sub.ephemeral,
                    sub.ephemeral_node_evict_delay_ns,
                    sub.updated_at_ns,
                ],
            )
            .map_err(map_sql_err)?;
        if changed == 0 {
            return Err(Error::not_found(format!("subscription {}", sub.id)));
        }
        tx.commit().map_err(map_sql_err)
    }

    pub fn delete_subscription(&self, id: &Uuid) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sql_err)?;
        let changed = tx
            .execute(
                "DELETE FROM subscriptions WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(map_sql_err)?;
        if changed == 0 {
            return Err(Error::not_found(format!("subscription {id}")));
        }
        tx.commit().map_err(map_sql_err)
    }

    pub fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, source_type, url, content, update_interval_ns,
                        enabled, ephemeral, ephemeral_node_evict_delay_ns,
                        created_at_ns, updated_at_ns
                 FROM subscriptions ORDER BY name",
            )
            .map_err(map_sql_err)?;
        let raw: Vec<SubscriptionRow> = stmt
            .query_map([], |row| {
                Ok(SubscriptionRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    source_type: row.get(2)?,
                    url: row.get(3)?,
                    content: row.get(4)?,
                    update_interval_ns: row.get(5)?,
                    enabled: row.get(6)?,
                    ephemeral: row.get(7)?,
                    ephemeral_node_evict_delay_ns: row.get(8)?,
                    created_at_ns: row.get(9)?,
                    updated_at_ns: row.get(10)?,
                })
            })
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(map_sql_err)?;

        raw.into_iter()
            .map(SubscriptionRow::into_subscription)
            .collect()
    }

    // --- Account-header rules ---

    pub fn upsert_rule(&self, rule: &AccountHeaderRule) -> Result<()> {
        let headers_json = serde_json::to_string(&rule.headers)
            .map_err(|e| Error::internal(format!("encode rule headers: {e}")))?;
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sql_err)?;
        tx.execute(
            "INSERT INTO account_header_rules (url_prefix, headers_json, updated_at_ns)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (url_prefix) DO UPDATE SET
                 headers_json = excluded.headers_json,
                 updated_at_ns = excluded.updated_at_ns",
            params![rule.url_prefix, headers_json, rule.updated_at_ns],
        )
        .map_err(map_sql_err)?;
        tx.commit().map_err(map_sql_err)
    }

    pub fn delete_rule(&self, url_prefix: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sql_err)?;
        let changed = tx
            .execute(
                "DELETE FROM account_header_rules WHERE url_prefix = ?1",
                params![url_prefix],
            )
            .map_err(map_sql_err)?;
        if changed == 0 {
            return Err(Error::not_found(format!("rule {url_prefix:?}")));
        }
        tx.commit().map_err(map_sql_err)
    }

    pub fn list_rules(&self) -> Result<Vec<AccountHeaderRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT url_prefix, headers_json, updated_at_ns
                 FROM account_header_rules ORDER BY url_prefix",
            )
            .map_err(map_sql_err)?;
        let raw: Vec<(String, String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(map_sql_err)?;

        raw.into_iter()
            .map(|(url_prefix, headers_json, updated_at_ns)| {
                let headers: Vec<String> = serde_json::from_str(&headers_json)
                    .map_err(|e| Error::internal(format!("corrupt rule row: {e}")))?;
                Ok(AccountHeaderRule {
                    url_prefix,
                    headers,
                    updated_at_ns,
                })
            })
            .collect()
    }

    // --- Parent id sets for boot repair ---

    pub fn platform_ids(&self) -> Result<Vec<Uuid>> {
        self.id_column("SELECT id FROM platforms")
    }

    pub fn subscription_ids(&self) -> Result<Vec<Uuid>> {
        self.id_column("SELECT id FROM subscriptions")
    }

    fn id_column(&self, sql: &str) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(map_sql_err)?;
        let raw: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(map_sql_err)?;
        raw.into_iter().map(|id| parse_uuid(&id)).collect()
    }
}

/// Shared connection setup: WAL-equivalent journaling and a cooperative busy
/// timeout for the single-writer discipline.
pub(crate) fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    // In-memory databases report "memory" here; the value is irrelevant.
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::internal(format!("corrupt uuid {raw:?}: {e}")))
}

fn encode_platform_filters(platform: &Platform) -> Result<(String, String)> {
    let regex_filters_json = serde_json::to_string(&platform.regex_filters)
        .map_err(|e| Error::internal(format!("encode regex filters: {e}")))?;
    let region_filters_json = serde_json::to_string(&platform.region_filters)
        .map_err(|e| Error::internal(format!("encode region filters: {e}")))?;
    Ok((regex_filters_json, region_filters_json))
}

struct PlatformRow {
    id: String,
    name: String,
    sticky_ttl_ns: i64,
    regex_filters_json: String,
    region_filters_json: String,
    miss_action: String,
    empty_account_behavior: String,
    fixed_account_header: String,
    allocation_policy: String,
    updated_at_ns: i64,
}

impl PlatformRow {
    fn into_platform(self) -> Result<Platform> {
        Ok(Platform {
            id: parse_uuid(&self.id)?,
            name: self.name,
            sticky_ttl_ns: self.sticky_ttl_ns,
            regex_filters: serde_json::from_str(&self.regex_filters_json)
                .map_err(|e| Error::internal(format!("corrupt regex filters: {e}")))?,
            region_filters: serde_json::from_str(&self.region_filters_json)
                .map_err(|e| Error::internal(format!("corrupt region filters: {e}")))?,
            reverse_proxy_miss_action: MissAction::parse(&self.miss_action)?,
            reverse_proxy_empty_account_behavior: EmptyAccountBehavior::parse(
                &self.empty_account_behavior,
            )?,
            reverse_proxy_fixed_account_header: self.fixed_account_header,
            allocation_policy: AllocationPolicy::parse(&self.allocation_policy)?,
            updated_at_ns: self.updated_at_ns,
        })
    }
}

struct SubscriptionRow {
    id: String,
    name: String,
    source_type: String,
    url: String,
    content: String,
    update_interval_ns: i64,
    enabled: bool,
    ephemeral: bool,
    ephemeral_node_evict_delay_ns: i64,
    created_at_ns: i64,
    updated_at_ns: i64,
}

impl SubscriptionRow {
    fn into_subscription(self) -> Result<Subscription> {
        Ok(Subscription {
            id: parse_uuid(&self.id)?,
            name: self.name,
            source_type: SourceType::parse(&self.source_type)?,
            url: self.url,
            content: self.content,
            update_interval_ns: self.update_interval_ns,
            enabled: self.enabled,
            ephemeral: self.ephemeral,
            ephemeral_node_evict_delay_ns: self.ephemeral_node_evict_delay_ns,
            created_at_ns: self.created_at_ns,
            updated_at_ns: self.updated_at_ns,
        })
    }
}
