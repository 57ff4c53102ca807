//! Subscriptions: named sources that supply node specs plus per-node tags.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::NANOS_PER_SEC;
use crate::error::{Error, Result};

/// Smallest allowed update interval (30 seconds).
pub const MIN_UPDATE_INTERVAL_NS: i64 = 30 * NANOS_PER_SEC;

/// Where a subscription's payload comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Fetched over HTTP from `url`.
    Remote,
    /// Read from the inline `content` blob.
    Local,
}

impl SourceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }

    /// # Errors
    ///
    /// `InvalidArgument` for an unknown value.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "remote" => Ok(Self::Remote),
            "local" => Ok(Self::Local),
            other => Err(Error::invalid(format!("unknown source type: {other}"))),
        }
    }
}

/// A subscription record as persisted in the strong store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    /// Unique, non-empty.
    pub name: String,
    pub source_type: SourceType,
    /// Non-empty exactly when `source_type` is remote.
    pub url: String,
    /// Non-empty exactly when `source_type` is local.
    pub content: String,
    pub update_interval_ns: i64,
    pub enabled: bool,
    /// Ephemeral subscriptions evict dropped nodes only after a grace
    /// period, so a node that reappears keeps its identity and health.
    pub ephemeral: bool,
    pub ephemeral_node_evict_delay_ns: i64,
    pub created_at_ns: i64,
    pub updated_at_ns: i64,
}

/// Caller-supplied subscription fields for create/update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub name: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
    pub update_interval_ns: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub ephemeral_node_evict_delay_ns: i64,
}

fn default_enabled() -> bool {
    true
}

impl SubscriptionSpec {
    /// Validates the spec against the strong-store invariants.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on empty name, a url/content combination that does
    /// not match the source type, a sub-minimum update interval, or a
    /// negative evict delay.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid("subscription name must not be empty"));
        }
        match self.source_type {
            SourceType::Remote => {
                if self.url.trim().is_empty() {
                    return Err(Error::invalid("remote subscription requires a url"));
                }
                if !self.content.is_empty() {
                    return Err(Error::invalid(
                        "remote subscription must not carry inline content",
                    ));
                }
            }
            SourceType::Local => {
                if self.content.trim().is_empty() {
                    return Err(Error::invalid("local subscription requires content"));
                }
                if !self.url.is_empty() {
                    return Err(Error::invalid("local subscription must not carry a url"));
                }
            }
        }
        if self.update_interval_ns < MIN_UPDATE_INTERVAL_NS {
            return Err(Error::invalid(format!(
                "update interval must be at least {MIN_UPDATE_INTERVAL_NS}ns (30s)"
            )));
        }
        if self.ephemeral_node_evict_delay_ns < 0 {
            return Err(Error::invalid("evict delay must not be negative"));
        }
        Ok(())
    }

    /// Materializes a subscription record from the spec.
    #[must_use]
    pub fn into_subscription(self, id: Uuid, now_ns: i64) -> Subscription {
        Subscription {
            id,
            name: self.name,
            source_type: self.source_type,
            url: self.url,
            content: self.content,
            update_interval_ns: self.update_interval_ns,
            enabled: self.enabled,
            ephemeral: self.ephemeral,
            ephemeral_node_evict_delay_ns: self.ephemeral_node_evict_delay_ns,
            created_at_ns: now_ns,
            updated_at_ns: now_ns,
        }
    }
}
