//! Platforms: named routing scopes with filter rules and allocation policy.

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::node::is_region_code;

/// Name of the reserved platform created at boot. It cannot be deleted or
/// renamed.
pub const DEFAULT_PLATFORM_NAME: &str = "DEFAULT";

/// What a reverse-proxy request does when no account can be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissAction {
    /// Select a node without writing a lease.
    Random,
    /// Refuse the request.
    Reject,
}

impl MissAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Random => "RANDOM",
            Self::Reject => "REJECT",
        }
    }

    /// # Errors
    ///
    /// `InvalidArgument` for an unknown value.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "RANDOM" => Ok(Self::Random),
            "REJECT" => Ok(Self::Reject),
            other => Err(Error::invalid(format!("unknown miss action: {other}"))),
        }
    }
}

/// How a reverse-proxy request without an account header derives its account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmptyAccountBehavior {
    /// Treat every request as its own caller (no affinity).
    PerRequest,
    /// Read the account from the platform's fixed header.
    FixedHeader,
}

impl EmptyAccountBehavior {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerRequest => "PER_REQUEST",
            Self::FixedHeader => "FIXED_HEADER",
        }
    }

    /// # Errors
    ///
    /// `InvalidArgument` for an unknown value.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "PER_REQUEST" => Ok(Self::PerRequest),
            "FIXED_HEADER" => Ok(Self::FixedHeader),
            other => Err(Error::invalid(format!(
                "unknown empty-account behavior: {other}"
            ))),
        }
    }
}

/// How the candidate view is pruned before selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationPolicy {
    /// Spread across the full candidate set.
    Balanced,
    /// Concentrate on the largest egress-IP group.
    Packed,
}

impl AllocationPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Balanced => "BALANCED",
            Self::Packed => "PACKED",
        }
    }

    /// # Errors
    ///
    /// `InvalidArgument` for an unknown value.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "BALANCED" => Ok(Self::Balanced),
            "PACKED" => Ok(Self::Packed),
            other => Err(Error::invalid(format!("unknown allocation policy: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// A named routing scope. Every request carries a platform identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    pub id: Uuid,
    /// Unique, non-empty.
    pub name: String,
    /// Lease lifetime; must be positive.
    pub sticky_ttl_ns: i64,
    /// Tag filters; a node qualifies when any filter matches any of its
    /// subscription tags. Empty means match all.
    pub regex_filters: Vec<String>,
    /// Lowercase region codes; empty means no region filter.
    pub region_filters: Vec<String>,
    pub reverse_proxy_miss_action: MissAction,
    pub reverse_proxy_empty_account_behavior: EmptyAccountBehavior,
    pub reverse_proxy_fixed_account_header: String,
    pub allocation_policy: AllocationPolicy,
    pub updated_at_ns: i64,
}

/// Caller-supplied platform fields for create/update/preview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformSpec {
    pub name: String,
    pub sticky_ttl_ns: i64,
    #[serde(default)]
    pub regex_filters: Vec<String>,
    #[serde(default)]
    pub region_filters: Vec<String>,
    pub reverse_proxy_miss_action: MissAction,
    pub reverse_proxy_empty_account_behavior: EmptyAccountBehavior,
    #[serde(default)]
    pub reverse_proxy_fixed_account_header: String,
    pub allocation_policy: AllocationPolicy,
}

impl PlatformSpec {
    /// Validates every field that the strong store will persist.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on empty name, non-positive TTL, uncompilable
    /// regex, or invalid region code.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid("platform name must not be empty"));
        }
        if self.sticky_ttl_ns <= 0 {
            return Err(Error::invalid("sticky_ttl_ns must be positive"));
        }
        for pattern in &self.regex_filters {
            Regex::new(pattern).map_err(|e| {
                Error::invalid(format!("regex filter {pattern:?} does not compile: {e}"))
            })?;
        }
        for region in &self.region_filters {
            if region.is_empty() || !is_region_code(region) {
                return Err(Error::invalid(format!(
                    "region filter {region:?} is not a lowercase two-letter code"
                )));
            }
        }
        if self.reverse_proxy_empty_account_behavior == EmptyAccountBehavior::FixedHeader
            && self.reverse_proxy_fixed_account_header.trim().is_empty()
        {
            return Err(Error::invalid(
                "fixed-header behavior requires reverse_proxy_fixed_account_header",
            ));
        }
        Ok(())
    }

    /// Compiles the regex filters. Call after `validate`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a pattern does not compile.
    pub fn compile_filters(&self) -> Result<Vec<Regex>> {
        self.regex_filters
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| Error::invalid(format!("regex filter {p:?} does not compile: {e}")))
            })
            .collect()
    }

    /// Materializes a platform record from the spec.
    #[must_use]
    pub fn into_platform(self, id: Uuid, updated_at_ns: i64) -> Platform {
        Platform {
            id,
            name: self.name,
            sticky_ttl_ns: self.sticky_ttl_ns,
            regex_filters: self.regex_filters,
            region_filters: self.region_filters,
            reverse_proxy_miss_action: self.reverse_proxy_miss_action,
            reverse_proxy_empty_account_behavior: self.reverse_proxy_empty_account_behavior,
            reverse_proxy_fixed_account_header: self.reverse_proxy_fixed_account_header,
            allocation_policy: self.allocation_policy,
            updated_at_ns,
        }
    }
}

impl Platform {
    /// The spec that would reproduce this platform.
    #[must_use]
    pub fn to_spec(&self) -> PlatformSpec {
        PlatformSpec {
            name: self.name.clone(),
            sticky_ttl_ns: self.sticky_ttl_ns,
            regex_filters: self.regex_filters.clone(),
            region_filters: self.region_filters.clone(),
            reverse_proxy_miss_action: self.reverse_proxy_miss_action,
            reverse_proxy_empty_account_behavior: self.reverse_proxy_empty_account_behavior,
            reverse_proxy_fixed_account_header: self.reverse_proxy_fixed_account_header.clone(),
            allocation_policy: self.allocation_policy,
        }
    }

    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.name == DEFAULT_PLATFORM_NAME
    }
}

/// The spec for the reserved `DEFAULT` platform created at boot.
#[must_use]
pub fn default_platform_spec(sticky_ttl_ns: i64) -> PlatformSpec {
    PlatformSpec {
        name: DEFAULT_PLATFORM_NAME.to_string(),
        sticky_ttl_ns,
        regex_filters: Vec::new(),
        region_filters: Vec::new(),
        reverse_proxy_miss_action: MissAction::Random,
        reverse_proxy_empty_account_behavior: EmptyAccountBehavior::PerRequest,
        reverse_proxy_fixed_account_header: String::new(),
        allocation_policy: AllocationPolicy::Balanced,
    }
}
