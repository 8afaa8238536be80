use crate::models::CatalogRef;
use crate::services::catalog_indexer::CatalogIndex;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
struct Entry {
    version: String,
    index: Arc<CatalogIndex>,
}

/// Indexed catalogs keyed by reference. An entry is only served while the source still
/// reports the version it was built from; jobs hold the `Arc` snapshot for their lifetime.
#[derive(Debug, Clone, Default)]
pub struct CatalogCache {
    entries: Arc<RwLock<HashMap<CatalogRef, Entry>>>,
}

static GLOBAL: std::sync::OnceLock<CatalogCache> = std::sync::OnceLock::new();

impl CatalogCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache shared by every job.
    pub fn global() -> &'static CatalogCache {
        GLOBAL.get_or_init(CatalogCache::new)
    }

    pub fn get(&self, catalog: &CatalogRef, version: &str) -> Option<Arc<CatalogIndex>> {
        let guard = self.entries.read().ok()?;
        guard
            .get(catalog)
            .filter(|e| e.version == version)
            .map(|e| Arc::clone(&e.index))
    }

    pub fn insert(
        &self,
        catalog: CatalogRef,
        version: &str,
        index: CatalogIndex,
    ) -> Arc<CatalogIndex> {
        let index = Arc::new(index);
        if let Ok(mut guard) = self.entries.write() {
            guard.insert(
                catalog,
                Entry {
                    version: version.to_string(),
                    index: Arc::clone(&index),
                },
            );
        }
        index
    }

    pub fn invalidate(&self, catalog: &CatalogRef) {
        if let Ok(mut guard) = self.entries.write() {
            guard.remove(catalog);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.entries.write() {
            guard.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
