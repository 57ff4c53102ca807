//! The persistence engine: a two-tier store.
//!
//! - The **strong** store ([`strong`]) holds config and topology; writes are
//!   serialized, transactional, and synchronous.
//! - The **weak** store ([`weak`]) holds high-churn runtime state; writes go
//!   through per-table dirty sets ([`dirty`]) and are batch-committed by the
//!   flush worker ([`flush`]).
//! - Schema evolution is additive and versioned ([`migrate`]); boot-time
//!   orphan repair cross-references the two stores ([`repair`]).

pub mod dirty;
pub mod flush;
pub mod migrate;
pub mod repair;
pub mod strong;
pub mod weak;

use std::path::PathBuf;

use resin_core::Error;

pub use dirty::{DirtyMark, DirtySet, DirtySnapshots, DirtyTracker};
pub use flush::{build_batch, BatchSink, FlushBatch, FlushEngine, FlushOutcome, FlushWorker, WeakReaders};
pub use repair::{repair, RepairReport};
pub use strong::StrongStore;
pub use weak::{LatencyRow, SubscriptionNodeRow, WeakLoad, WeakStore, WeakTable};

/// Filesystem locations of the two stores.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub strong: PathBuf,
    pub weak: PathBuf,
}

impl StorePaths {
    /// Conventional layout: `<dir>/strong.db` and `<dir>/weak.db`.
    #[must_use]
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            strong: dir.join("strong.db"),
            weak: dir.join("weak.db"),
        }
    }
}

/// Maps a SQLite error onto the API error kinds: constraint violations are
/// `Conflict` (unique-name collisions), everything else is `Internal`.
pub(crate) fn map_sql_err(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(inner, message)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::conflict(
                message
                    .clone()
                    .unwrap_or_else(|| "constraint violation".to_string()),
            )
        }
        _ => Error::internal(err.to_string()),
    }
}
