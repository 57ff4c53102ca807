//! In-memory platform directory with compiled filter regexes.
//!
//! The strong store owns the durable platform records; this directory is the
//! read-side index the routing engine consults on every request. Entries are
//! whole `Arc<PlatformRuntime>` values swapped on CRUD, so readers never see
//! a partially updated platform.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use resin_core::{Platform, Result};

use crate::pool::PlatformRuntime;

#[derive(Default)]
pub struct PlatformDirectory {
    by_id: RwLock<HashMap<Uuid, Arc<PlatformRuntime>>>,
    by_name: RwLock<HashMap<String, Uuid>>,
}

impl PlatformDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a platform, compiling its filters.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a stored regex fails to compile.
    pub fn upsert(&self, platform: Platform) -> Result<Arc<PlatformRuntime>> {
        let runtime = Arc::new(PlatformRuntime::new(platform)?);
        let id = runtime.platform.id;

        let mut by_id = self.by_id.write();
        let mut by_name = self.by_name.write();
        if let Some(previous) = by_id.get(&id) {
            by_name.remove(&previous.platform.name);
        }
        by_name.insert(runtime.platform.name.clone(), id);
        by_id.insert(id, Arc::clone(&runtime));
        Ok(runtime)
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<PlatformRuntime>> {
        let mut by_id = self.by_id.write();
        let removed = by_id.remove(id)?;
        self.by_name.write().remove(&removed.platform.name);
        Some(removed)
    }

    #[must_use]
    pub fn get(&self, id: &Uuid) -> Option<Arc<PlatformRuntime>> {
        self.by_id.read().get(id).cloned()
    }

    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<Arc<PlatformRuntime>> {
        let id = *self.by_name.read().get(name)?;
        self.get(&id)
    }

    #[must_use]
    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.read().contains_key(name)
    }

    /// All platforms, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<PlatformRuntime>> {
        let mut platforms: Vec<Arc<PlatformRuntime>> =
            self.by_id.read().values().cloned().collect();
        platforms.sort_by(|a, b| a.platform.name.cmp(&b.platform.name));
        platforms
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.read().is_empty()
    }
}
