//! Capability contracts between the control plane and its collaborators.
//!
//! The data plane, transport builder, fetcher, and GeoIP resolver are
//! injected as small trait objects at construction. This keeps the control
//! plane testable with stubs and keeps the data plane from becoming a
//! dependency of the control plane.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

/// A live outbound transport, opaque to the control plane.
///
/// The control plane only tracks *whether* a node has one; the data plane
/// downcasts or wraps as it sees fit. Used as `Arc<dyn OutboundTransport>`.
pub trait OutboundTransport: Send + Sync {
    /// Short human-readable description for logs.
    fn describe(&self) -> &str {
        "outbound"
    }
}

/// Builds a live transport from a node's canonical raw options.
///
/// Invoked from the pool's node-added hook; construction may suspend
/// (dial, TLS setup). A node is not routable until the build completes.
#[async_trait]
pub trait OutboundBuilder: Send + Sync {
    async fn build(&self, raw_options: &[u8]) -> anyhow::Result<Arc<dyn OutboundTransport>>;
}

/// Fetches a remote subscription payload.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, user_agent: &str, timeout: Duration)
        -> anyhow::Result<Vec<u8>>;
}

/// Maps an egress IP to a region code.
///
/// Pure and synchronous; implementations are expected to cache. Returns a
/// two-letter lowercase code, or `""` when unknown.
pub trait GeoLookup: Send + Sync {
    fn region(&self, ip: &str) -> String;
}

/// A finished data-plane request, pushed into the control plane to bias
/// future routing.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFinished {
    pub platform_id: Uuid,
    pub node_hash: String,
    /// Lowercased host the request targeted.
    pub authority: String,
    pub ok: bool,
    pub latency_ns: i64,
}

/// Receives request-finished events. The control plane implements this; the
/// data plane's emitter fans events out to it.
pub trait RequestObserver: Send + Sync {
    fn on_request_finished(&self, event: RequestFinished);
}
