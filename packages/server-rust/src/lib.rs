//! Resin Server -- the control plane of a multi-tenant outbound proxy fleet.
//!
//! Chooses which upstream node carries each client request, preserves
//! per-account affinity through sticky leases, watches fleet health, and
//! persists the little state that must survive restart while discarding the
//! mass of runtime telemetry:
//!
//! - **Pool** ([`pool`]): the in-memory node fleet with circuit breakers,
//!   egress attribution, per-authority latency, and candidate views
//! - **Routing** ([`routing`]): sticky leases and P2C selection
//! - **Subscription** ([`subscription`]): source registry, payload parsing,
//!   and the reconcile scheduler
//! - **Persist** ([`persist`]): the strong/weak two-tier store with dirty
//!   sets, the flush worker, migrations, and boot repair
//! - **Control** ([`control`]): the facade wiring it all together
//! - **Shutdown** ([`shutdown`]): cooperative worker teardown

pub mod control;
pub mod fetch;
pub mod persist;
pub mod platforms;
pub mod pool;
pub mod routing;
pub mod shutdown;
pub mod subscription;
pub mod telemetry;

pub use control::{Collaborators, ControlPlane, NullGeoLookup};
pub use fetch::HttpFetcher;
pub use persist::StorePaths;
pub use platforms::PlatformDirectory;
pub use pool::{
    AddOutcome, CandidateCache, NodeEntry, NodeFilter, NodePool, NodeView, PlatformRuntime,
};
pub use routing::{RouteError, RoutingEngine};
pub use shutdown::{InFlightGuard, RunState, ShutdownController};
pub use subscription::{
    parse_outbounds, ParsedOutbound, SubscriptionRegistry, SubscriptionScheduler,
};
pub use telemetry::init_tracing;
