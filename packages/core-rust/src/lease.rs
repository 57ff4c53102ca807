//! Leases: sticky (platform, account) → node bindings with bounded lifetime.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a lease row: one per `(platform, account)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseKey {
    pub platform_id: Uuid,
    pub account: String,
}

impl LeaseKey {
    #[must_use]
    pub fn new(platform_id: Uuid, account: impl Into<String>) -> Self {
        Self {
            platform_id,
            account: account.into(),
        }
    }
}

/// A sticky binding from `(platform, account)` to a node.
///
/// `egress_ip` is the node's egress at lease creation; it is written once
/// and never refreshed in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub platform_id: Uuid,
    pub account: String,
    pub node_hash: String,
    pub egress_ip: String,
    pub created_at_ns: i64,
    pub expiry_ns: i64,
    pub last_accessed_ns: i64,
}

impl Lease {
    /// A lease has expired once `now` reaches `expiry_ns`. Liveness
    /// additionally requires the node to still be pooled and its circuit
    /// closed, which the routing engine checks against the pool.
    #[must_use]
    pub fn is_expired(&self, now_ns: i64) -> bool {
        now_ns >= self.expiry_ns
    }

    #[must_use]
    pub fn key(&self) -> LeaseKey {
        LeaseKey::new(self.platform_id, self.account.clone())
    }
}
