//! Content-addressed relational catalog
//!
//! ## Schema Overview
//!
//! ```text
//! Entity (typed rows, key derived from attributes)
//!   ├── Link<T>       tagged union: content id + type tag + variant
//!   ├── LinkSet<K>    unordered set: hash of sorted member ids + count
//!   │     └── SetMember<K> (one row per member, index = sorted position)
//!   └── Computed      key_source() + make(key), driven by populate()
//! ```
//!
//! Row identity is a deterministic function of immutable attributes, so
//! re-inserting the same logical row yields the same id and is a no-op.
//!
//! ## Usage
//!
//! ```rust
//! use foundation::catalog::{Catalog, Link};
//! use foundation::params::RateKind;
//!
//! # fn example() -> foundation::Result<()> {
//! let catalog = Catalog::new();
//! let id = Link::fill(&catalog, RateKind::Rate { period: 0.1 })?;
//! assert_eq!(id, Link::fill(&catalog, RateKind::Rate { period: 0.1 })?);
//! # Ok(())
//! # }
//! ```

mod jobs;
mod link;
mod populate;
mod set;
mod table;

pub use jobs::{JobGuard, JobInfo, JobTable};
pub use link::{Link, LinkKind};
pub use populate::{populate, populate_where, Computed, PopulateOptions, PopulateReport};
pub use set::{LinkSet, SetKind, SetMember};
pub use table::EntityTable;

use std::any::Any;
use std::fmt::Debug;
use std::hash::Hash;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, Result};

/// A catalog row type.
///
/// `TABLE` names the table; `key()` projects the primary key.
pub trait Entity:
    Serialize + DeserializeOwned + Clone + PartialEq + Debug + Send + Sync + 'static
{
    /// Table name, unique within a catalog
    const TABLE: &'static str;

    /// Primary key
    type Key: Serialize + DeserializeOwned + Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static;

    /// Primary key of this row
    fn key(&self) -> Self::Key;
}

/// Deterministic content id of a serializable value.
///
/// The value is canonicalized through `serde_json::Value` (object keys are
/// sorted) and hashed with BLAKE3; the id is the first 128 bits in hex.
///
/// # Errors
/// Returns error if the value cannot be serialized
pub fn content_id<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let canonical = serde_json::to_value(value)?;
    let bytes = serde_json::to_vec(&canonical)?;
    let digest = blake3::hash(&bytes).to_hex();
    Ok(digest[..32].to_string())
}

/// Render a key for messages and job ids.
pub(crate) fn render_key<K: Serialize + Debug>(key: &K) -> String {
    serde_json::to_string(key).unwrap_or_else(|_| format!("{key:?}"))
}

trait AnyTable: Send + Sync {
    fn snapshot(&self) -> Result<serde_json::Value>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<E: Entity> AnyTable for EntityTable<E> {
    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.rows())?)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A set of entity tables plus the job-reservation table.
#[derive(Default)]
pub struct Catalog {
    tables: DashMap<&'static str, Arc<dyn AnyTable>>,
    pending: DashMap<String, serde_json::Value>,
    jobs: JobTable,
}

impl Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.tables.iter().map(|e| *e.key()).collect();
        names.sort_unstable();
        f.debug_struct("Catalog").field("tables", &names).finish()
    }
}

impl Catalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table handle for `E`, created on first use.
    ///
    /// # Errors
    /// Returns error if a loaded snapshot for this table does not decode, or
    /// if the table name is already bound to another row type
    pub fn table<E: Entity>(&self) -> Result<Arc<EntityTable<E>>> {
        let slot = match self.tables.entry(E::TABLE) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let table = EntityTable::<E>::new();
                if let Some(snapshot) = self.pending.get(E::TABLE) {
                    table.restore(snapshot.value())?;
                }
                self.pending.remove(E::TABLE);
                let slot: Arc<dyn AnyTable> = Arc::new(table);
                Arc::clone(entry.insert(slot).value())
            }
        };
        slot.into_any().downcast::<EntityTable<E>>().map_err(|_| {
            Error::StorageError(format!(
                "table `{}` is bound to a different row type",
                E::TABLE
            ))
        })
    }

    /// Insert one row into its table.
    ///
    /// # Errors
    /// Returns `DuplicateKey` if a different row with the same key exists
    pub fn insert<E: Entity>(&self, row: E) -> Result<bool> {
        self.table::<E>()?.insert(row)
    }

    /// Fetch exactly one row by key.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if the row is absent
    pub fn fetch1<E: Entity>(&self, key: &E::Key) -> Result<E> {
        self.table::<E>()?.fetch1(key)
    }

    /// Job-reservation table.
    #[must_use]
    pub const fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    /// Write every table to a JSON snapshot at `path` (atomic replace).
    ///
    /// # Errors
    /// Returns error if serialization or the write fails
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut snapshot = serde_json::Map::new();
        for entry in &self.pending {
            snapshot.insert(entry.key().clone(), entry.value().clone());
        }
        for entry in &self.tables {
            snapshot.insert((*entry.key()).to_string(), entry.value().snapshot()?);
        }

        let path = path.as_ref();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut staged, &serde_json::Value::Object(snapshot))?;
        staged.flush()?;
        staged.persist(path).map_err(|e| e.error)?;

        tracing::debug!(path = %path.display(), "catalog saved");
        Ok(())
    }

    /// Load a snapshot written by [`Catalog::save`]. Tables decode lazily on first use.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is not a JSON object
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        let serde_json::Value::Object(tables) = value else {
            return Err(Error::StorageError(
                "catalog snapshot must be a JSON object".to_string(),
            ));
        };
        let catalog = Self::new();
        for (name, rows) in tables {
            catalog.pending.insert(name, rows);
        }
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        note_id: u32,
        label: String,
    }

    impl Entity for Note {
        const TABLE: &'static str = "note";
        type Key = u32;
        fn key(&self) -> u32 {
            self.note_id
        }
    }

    #[test]
    fn test_content_id_is_order_independent_for_objects() {
        let a = serde_json::json!({"b": 1, "a": [1.5, 2.0]});
        let b = serde_json::json!({"a": [1.5, 2.0], "b": 1});
        assert_eq!(content_id(&a).unwrap(), content_id(&b).unwrap());
        assert_eq!(content_id(&a).unwrap().len(), 32);
    }

    #[test]
    fn test_content_id_distinguishes_values() {
        assert_ne!(content_id(&[1, 2]).unwrap(), content_id(&[2, 1]).unwrap());
    }

    #[test]
    fn test_table_handles_share_rows() {
        let catalog = Catalog::new();
        catalog
            .insert(Note { note_id: 1, label: "a".into() })
            .unwrap();
        assert_eq!(catalog.table::<Note>().unwrap().len(), 1);
        assert_eq!(catalog.fetch1::<Note>(&1).unwrap().label, "a");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        let catalog = Catalog::new();
        catalog
            .insert(Note { note_id: 7, label: "x".into() })
            .unwrap();
        catalog.save(&path).unwrap();

        let loaded = Catalog::load(&path).unwrap();
        assert_eq!(loaded.fetch1::<Note>(&7).unwrap().label, "x");

        // untouched tables survive a second save
        let again = dir.path().join("again.json");
        Catalog::load(&path).unwrap().save(&again).unwrap();
        assert_eq!(Catalog::load(&again).unwrap().table::<Note>().unwrap().len(), 1);
    }

    #[test]
    fn test_float_rows_refill_after_load() {
        use crate::params::RateKind;
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let periods: Vec<f64> = (0..2000)
            .map(|_| rng.gen::<f64>() * 1e3)
            .chain([0.1, 1.0 / 3.0, f64::MIN_POSITIVE, 1e-300, 123_456.789_012_345_67])
            .collect();

        let catalog = Catalog::new();
        let ids: Vec<String> = periods
            .iter()
            .map(|&period| Link::fill(&catalog, RateKind::Rate { period }).unwrap())
            .collect();
        catalog.save(&path).unwrap();

        let loaded = Catalog::load(&path).unwrap();
        for (&period, id) in periods.iter().zip(&ids) {
            assert_eq!(&Link::fill(&loaded, RateKind::Rate { period }).unwrap(), id);
            assert_eq!(
                Link::<RateKind>::get(&loaded, id).unwrap(),
                RateKind::Rate { period }
            );
        }
    }
}
