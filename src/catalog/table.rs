//! Typed entity table on a concurrent hashmap.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{render_key, Entity};
use crate::{Error, Result};

/// Rows of one entity type, keyed by primary key.
///
/// Inserts are append-only; [`EntityTable::replace`] exists for progress
/// rows that are overwritten in place.
#[derive(Debug)]
pub struct EntityTable<E: Entity> {
    rows: DashMap<E::Key, E>,
}

impl<E: Entity> Default for EntityTable<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> EntityTable<E> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }

    /// Insert a row.
    ///
    /// Returns `true` if the row was added, `false` if an identical row
    /// already existed.
    ///
    /// # Errors
    /// Returns `DuplicateKey` if a row with the same key but different
    /// attributes exists
    pub fn insert(&self, row: E) -> Result<bool> {
        match self.rows.entry(row.key()) {
            Entry::Occupied(existing) => {
                if existing.get() == &row {
                    Ok(false)
                } else {
                    Err(Error::DuplicateKey {
                        table: E::TABLE.to_string(),
                        key: render_key(existing.key()),
                    })
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(row);
                Ok(true)
            }
        }
    }

    /// Insert several rows, returning how many were new.
    ///
    /// # Errors
    /// Stops at the first `DuplicateKey`
    pub fn insert_many(&self, rows: impl IntoIterator<Item = E>) -> Result<usize> {
        let mut added = 0;
        for row in rows {
            if self.insert(row)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Replace the row with the same key, returning the previous one.
    pub fn replace(&self, row: E) -> Option<E> {
        self.rows.insert(row.key(), row)
    }

    /// Remove a row by key.
    pub fn remove(&self, key: &E::Key) -> Option<E> {
        self.rows.remove(key).map(|(_, row)| row)
    }

    /// Row by key, if present.
    #[must_use]
    pub fn get(&self, key: &E::Key) -> Option<E> {
        self.rows.get(key).map(|row| row.value().clone())
    }

    /// Exactly one row by key.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if absent
    pub fn fetch1(&self, key: &E::Key) -> Result<E> {
        self.get(key).ok_or_else(|| {
            Error::MissingUpstream(format!("`{}` has no row {}", E::TABLE, render_key(key)))
        })
    }

    /// Whether a key is present.
    #[must_use]
    pub fn contains(&self, key: &E::Key) -> bool {
        self.rows.contains_key(key)
    }

    /// All keys in ascending order.
    #[must_use]
    pub fn keys(&self) -> Vec<E::Key> {
        let mut keys: Vec<E::Key> = self.rows.iter().map(|row| row.key().clone()).collect();
        keys.sort();
        keys
    }

    /// All rows in key order.
    #[must_use]
    pub fn rows(&self) -> Vec<E> {
        self.restrict(|_| true)
    }

    /// Rows matching `predicate`, in key order.
    #[must_use]
    pub fn restrict<F>(&self, predicate: F) -> Vec<E>
    where
        F: Fn(&E) -> bool,
    {
        let mut rows: Vec<(E::Key, E)> = self
            .rows
            .iter()
            .filter(|row| predicate(row.value()))
            .map(|row| (row.key().clone(), row.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter().map(|(_, row)| row).collect()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub(super) fn restore(&self, snapshot: &serde_json::Value) -> Result<()> {
        let rows: Vec<E> = serde_json::from_value(snapshot.clone())?;
        for row in rows {
            self.rows.insert(row.key(), row);
        }
        Ok(())
    }
}
