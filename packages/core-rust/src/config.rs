//! Versioned runtime configuration.
//!
//! A single `SystemConfig` record governs the whole control plane. It is read
//! through an atomic pointer and mutated copy-on-write, so readers never see
//! a partially updated config. The strong store persists it as a JSON column
//! with a monotonically increasing version.

use serde::{Deserialize, Serialize};

use crate::clock::{NANOS_PER_MILLI, NANOS_PER_SEC};
use crate::error::{Error, Result};

/// The runtime configuration singleton.
///
/// Duration fields are i64 nanoseconds (`_ns` suffix in JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Monotonically increasing; bumped on every update.
    pub version: u64,

    // --- Node health ---
    /// Consecutive failures at which a node's circuit opens.
    pub max_consecutive_failures: u32,
    /// EWMA half-life for latency observations.
    pub latency_decay_window_ns: i64,
    /// Max authorities retained per node's latency table.
    pub max_latency_table_entries: usize,
    /// Authorities tracked individually; anything else buckets to `""`.
    pub authorities: Vec<String>,

    // --- Probes and fetches ---
    pub resource_fetch_timeout_ns: i64,
    pub probe_timeout_ns: i64,
    pub user_agent: String,

    // --- Persistence flush ---
    /// Dirty-key count that triggers a flush.
    pub flush_dirty_threshold: usize,
    /// Max time between flushes while dirty.
    pub flush_interval_ns: i64,
    /// Flush worker evaluation tick.
    pub flush_tick_ns: i64,

    // --- Background workers ---
    pub scheduler_tick_ns: i64,
    pub scheduler_fetch_concurrency: usize,
    pub lease_sweep_interval_ns: i64,
    pub metrics_sample_interval_ns: i64,

    // --- Defaults for created entities ---
    /// Sticky TTL used when creating the reserved DEFAULT platform.
    pub default_sticky_ttl_ns: i64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            version: 1,
            max_consecutive_failures: 3,
            latency_decay_window_ns: 60 * NANOS_PER_SEC,
            max_latency_table_entries: 16,
            authorities: Vec::new(),
            resource_fetch_timeout_ns: 15 * NANOS_PER_SEC,
            probe_timeout_ns: 5 * NANOS_PER_SEC,
            user_agent: "resin/0.1".to_string(),
            flush_dirty_threshold: 512,
            flush_interval_ns: 5 * NANOS_PER_SEC,
            flush_tick_ns: 500 * NANOS_PER_MILLI,
            scheduler_tick_ns: 10 * NANOS_PER_SEC,
            scheduler_fetch_concurrency: 4,
            lease_sweep_interval_ns: 30 * NANOS_PER_SEC,
            metrics_sample_interval_ns: 10 * NANOS_PER_SEC,
            default_sticky_ttl_ns: 30 * 60 * NANOS_PER_SEC,
        }
    }
}

impl SystemConfig {
    /// Validates every field an update may change.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for non-positive durations, a zero flush threshold,
    /// or zero fetch concurrency.
    pub fn validate(&self) -> Result<()> {
        if self.max_consecutive_failures == 0 {
            return Err(Error::invalid("max_consecutive_failures must be positive"));
        }
        if self.max_latency_table_entries == 0 {
            return Err(Error::invalid("max_latency_table_entries must be positive"));
        }
        if self.flush_dirty_threshold == 0 {
            return Err(Error::invalid("flush_dirty_threshold must be positive"));
        }
        if self.scheduler_fetch_concurrency == 0 {
            return Err(Error::invalid("scheduler_fetch_concurrency must be positive"));
        }
        for (name, value) in [
            ("latency_decay_window_ns", self.latency_decay_window_ns),
            ("resource_fetch_timeout_ns", self.resource_fetch_timeout_ns),
            ("probe_timeout_ns", self.probe_timeout_ns),
            ("flush_interval_ns", self.flush_interval_ns),
            ("flush_tick_ns", self.flush_tick_ns),
            ("scheduler_tick_ns", self.scheduler_tick_ns),
            ("lease_sweep_interval_ns", self.lease_sweep_interval_ns),
            ("metrics_sample_interval_ns", self.metrics_sample_interval_ns),
            ("default_sticky_ttl_ns", self.default_sticky_ttl_ns),
        ] {
            if value <= 0 {
                return Err(Error::invalid(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Whether an authority has its own latency bucket; everything else
    /// falls back to the wildcard bucket `""`.
    #[must_use]
    pub fn authority_bucket<'a>(&self, authority: &'a str) -> &'a str {
        if self.authorities.iter().any(|a| a == authority) {
            authority
        } else {
            ""
        }
    }
}
