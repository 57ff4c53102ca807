//! Platform candidate views: filtering and allocation-policy pruning.
//!
//! A node is a candidate for a platform when it has a prepared outbound
//! transport, its circuit is closed, its egress region passes the platform's
//! region filters, and at least one regex filter matches one of its
//! subscription tags (empty filter lists match everything). BALANCED
//! platforms keep the whole filtered set; PACKED platforms keep only the
//! largest egress-IP group.
//!
//! Views are cached per platform and invalidated by the pool's generation
//! counter and the platform's `updated_at_ns`.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use uuid::Uuid;

use resin_core::{AllocationPolicy, Platform, Result};

use crate::subscription::SubscriptionRegistry;

use super::NodePool;

// ---------------------------------------------------------------------------
// PlatformRuntime
// ---------------------------------------------------------------------------

/// A platform record with its regex filters compiled once.
#[derive(Debug)]
pub struct PlatformRuntime {
    pub platform: Platform,
    pub regexes: Vec<Regex>,
}

impl PlatformRuntime {
    /// Compiles the platform's filters.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if any stored pattern fails to compile (possible
    /// only for rows written by an older, more permissive build).
    pub fn new(platform: Platform) -> Result<Self> {
        let regexes = platform.to_spec().compile_filters()?;
        Ok(Self { platform, regexes })
    }
}

// ---------------------------------------------------------------------------
// Candidate computation
// ---------------------------------------------------------------------------

/// Computes the candidate set for a platform, sorted by hash.
#[must_use]
pub fn compute_candidates(
    runtime: &PlatformRuntime,
    pool: &NodePool,
    registry: &SubscriptionRegistry,
) -> Vec<String> {
    let platform = &runtime.platform;
    let mut eligible: Vec<(String, Option<String>, String)> = Vec::new();

    for entry in pool.entries() {
        if !entry.has_outbound() {
            continue;
        }
        let dynamic = entry.dynamic();
        if dynamic.circuit_open() {
            continue;
        }
        if !platform.region_filters.is_empty()
            && !platform
                .region_filters
                .iter()
                .any(|r| r == &dynamic.egress_region)
        {
            continue;
        }
        if !runtime.regexes.is_empty() {
            let tags = registry.tags_for_node(entry.hash());
            let matched = runtime
                .regexes
                .iter()
                .any(|re| tags.iter().any(|tag| re.is_match(tag)));
            if !matched {
                continue;
            }
        }
        eligible.push((
            entry.hash().to_string(),
            dynamic.egress_ip,
            dynamic.egress_region,
        ));
    }

    let mut hashes: Vec<String> = match platform.allocation_policy {
        AllocationPolicy::Balanced => eligible.into_iter().map(|(hash, _, _)| hash).collect(),
        AllocationPolicy::Packed => pack_largest_group(eligible),
    };
    hashes.sort();
    hashes
}

/// PACKED pruning: keep only the largest egress-IP group. Size ties break to
/// the lowest region code, then to the lowest egress IP. Nodes with unknown
/// egress group together under the empty key.
fn pack_largest_group(eligible: Vec<(String, Option<String>, String)>) -> Vec<String> {
    let mut groups: HashMap<String, (String, Vec<String>)> = HashMap::new();
    for (hash, egress_ip, region) in eligible {
        let key = egress_ip.unwrap_or_default();
        let group = groups
            .entry(key)
            .or_insert_with(|| (region.clone(), Vec::new()));
        if region < group.0 {
            group.0 = region;
        }
        group.1.push(hash);
    }

    groups
        .into_iter()
        .map(|(ip, (region, hashes))| (hashes.len(), region, ip, hashes))
        .min_by(|a, b| {
            // Largest group first; then lowest region, then lowest IP.
            b.0.cmp(&a.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        })
        .map(|(_, _, _, hashes)| hashes)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// CandidateCache
// ---------------------------------------------------------------------------

struct CachedView {
    pool_generation: u64,
    platform_updated_at_ns: i64,
    hashes: Arc<Vec<String>>,
}

/// Per-platform candidate cache.
#[derive(Default)]
pub struct CandidateCache {
    views: DashMap<Uuid, CachedView>,
}

impl CandidateCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached view, rebuilding when the pool mutated or the
    /// platform config changed since it was computed.
    #[must_use]
    pub fn get_or_build(
        &self,
        runtime: &PlatformRuntime,
        pool: &NodePool,
        registry: &SubscriptionRegistry,
    ) -> Arc<Vec<String>> {
        let generation = pool.generation();
        let updated_at = runtime.platform.updated_at_ns;

        if let Some(view) = self.views.get(&runtime.platform.id) {
            if view.pool_generation == generation && view.platform_updated_at_ns == updated_at {
                return Arc::clone(&view.hashes);
            }
        }

        let hashes = Arc::new(compute_candidates(runtime, pool, registry));
        self.views.insert(
            runtime.platform.id,
            CachedView {
                pool_generation: generation,
                platform_updated_at_ns: updated_at,
                hashes: Arc::clone(&hashes),
            },
        );
        hashes
    }

    /// Drops one platform's cached view (explicit rebuild request).
    pub fn invalidate(&self, platform_id: &Uuid) {
        self.views.remove(platform_id);
    }

    /// Drops every cached view.
    pub fn clear(&self) {
        self.views.clear();
    }
}
