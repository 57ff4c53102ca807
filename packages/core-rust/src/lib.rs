//! Resin Core -- domain model, content hashing, and capability traits.
//!
//! This crate provides the foundation layer for the Resin control plane:
//!
//! - **Clock** ([`clock`]): i64 nanosecond timestamps with an injectable source
//! - **Hash** ([`hash`]): SHA-256 content hashing for node identity
//! - **Node** ([`node`]): static/dynamic node state and the latency table
//! - **Platform** ([`platform`]): routing scopes, filters, allocation policy
//! - **Subscription** ([`subscription`]): node sources and their validation
//! - **Lease** ([`lease`]): sticky (platform, account) → node bindings
//! - **Rules** ([`rules`]): account-header rule resolution
//! - **Authority** ([`authority`]): host extraction for latency bucketing
//! - **Config** ([`config`]): the versioned runtime configuration singleton
//! - **Traits** ([`traits`]): collaborator capability contracts
//! - **Error** ([`error`]): structured error kinds for the API layer

pub mod authority;
pub mod clock;
pub mod config;
pub mod error;
pub mod hash;
pub mod lease;
pub mod node;
pub mod platform;
pub mod rules;
pub mod subscription;
pub mod traits;

// Error
pub use error::{Error, Result};

// Clock
pub use clock::{now_ns, Clock, ManualClock, SystemClock, NANOS_PER_MILLI, NANOS_PER_SEC};

// Hash
pub use hash::{canonical_options, node_hash};

// Node
pub use node::{is_region_code, LatencyEntry, LatencyTable, NodeDynamic, NodeStatic};

// Platform
pub use platform::{
    default_platform_spec, AllocationPolicy, EmptyAccountBehavior, MissAction, Platform,
    PlatformSpec, DEFAULT_PLATFORM_NAME,
};

// Subscription
pub use subscription::{SourceType, Subscription, SubscriptionSpec, MIN_UPDATE_INTERVAL_NS};

// Lease
pub use lease::{Lease, LeaseKey};

// Rules
pub use rules::{AccountHeaderRule, RuleTable, WILDCARD_PREFIX};

// Authority
pub use authority::extract_authority;

// Config
pub use config::SystemConfig;

// Traits
pub use traits::{
    Fetcher, GeoLookup, OutboundBuilder, OutboundTransport, RequestFinished, RequestObserver,
};
