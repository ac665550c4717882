//! Catalog, blob store and settings bundled for `make` calls.

use std::sync::Arc;

use crate::blob::{BlobStore, FsBlobStore, MemoryBlobStore};
use crate::catalog::{Catalog, Entity, EntityTable};
use crate::config::Settings;
use crate::Result;

/// Everything a computed entity may read or write.
pub struct Workspace {
    catalog: Catalog,
    blobs: Arc<dyn BlobStore>,
    settings: Settings,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("catalog", &self.catalog)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    /// Assemble a workspace from parts.
    #[must_use]
    pub fn new(catalog: Catalog, blobs: Arc<dyn BlobStore>, settings: Settings) -> Self {
        Self {
            catalog,
            blobs,
            settings,
        }
    }

    /// Empty catalog over an in-memory blob store (tests, notebooks).
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(
            Catalog::new(),
            Arc::new(MemoryBlobStore::new()),
            Settings::default(),
        )
    }

    /// Catalog over a filesystem blob store at `settings.root`.
    ///
    /// # Errors
    /// Returns error if the root cannot be created
    pub fn open(catalog: Catalog, settings: Settings) -> Result<Self> {
        let blobs = FsBlobStore::open(&settings.root)?;
        Ok(Self::new(catalog, Arc::new(blobs), settings))
    }

    /// Catalog
    #[must_use]
    pub const fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Blob store
    #[must_use]
    pub fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    /// Shared handle to the blob store
    #[must_use]
    pub fn blob_handle(&self) -> Arc<dyn BlobStore> {
        Arc::clone(&self.blobs)
    }

    /// Settings
    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Override settings (tests and drivers).
    #[must_use]
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Table handle shortcut.
    ///
    /// # Errors
    /// See [`Catalog::table`]
    pub fn table<E: Entity>(&self) -> Result<Arc<EntityTable<E>>> {
        self.catalog.table::<E>()
    }

    /// Fetch one row shortcut.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if absent
    pub fn fetch1<E: Entity>(&self, key: &E::Key) -> Result<E> {
        self.catalog.fetch1::<E>(key)
    }
}
