//! Tagged-union entities
//!
//! A `Link<T>` row holds a content id, the variant's type tag and the
//! variant itself. Inserting a variant is the canonical way to mint its id;
//! the enum `T` carries the capabilities (resample, standardize, ...) that
//! callers reach through [`Link::get`].

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{content_id, Catalog, Entity};
use crate::Result;

/// A closed set of variants stored in one link table.
pub trait LinkKind:
    Serialize + DeserializeOwned + Clone + PartialEq + Debug + Send + Sync + 'static
{
    /// Link table name
    const TABLE: &'static str;

    /// Tag naming the variant
    fn type_tag(&self) -> &'static str;
}

/// Row of a link table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: LinkKind")]
pub struct Link<T: LinkKind> {
    /// Content id of `(type_tag, variant)`
    pub id: String,
    /// Variant tag
    pub type_tag: String,
    /// Variant attributes
    pub variant: T,
}

impl<T: LinkKind> Entity for Link<T> {
    const TABLE: &'static str = T::TABLE;
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }
}

impl<T: LinkKind> Link<T> {
    /// Build the row for `variant`, deriving its id.
    ///
    /// # Errors
    /// Returns error if the variant cannot be serialized
    pub fn new(variant: T) -> Result<Self> {
        let type_tag = variant.type_tag();
        Ok(Self {
            id: content_id(&(T::TABLE, type_tag, &variant))?,
            type_tag: type_tag.to_string(),
            variant,
        })
    }

    /// Insert `variant` (idempotent) and return its id.
    ///
    /// # Errors
    /// Returns error if serialization or the insert fails
    pub fn fill(catalog: &Catalog, variant: T) -> Result<String> {
        let row = Self::new(variant)?;
        let id = row.id.clone();
        catalog.insert(row)?;
        Ok(id)
    }

    /// Resolve an id to its variant.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if the id is unknown
    pub fn get(catalog: &Catalog, id: &str) -> Result<T> {
        Ok(catalog.fetch1::<Self>(&id.to_string())?.variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Shape {
        Circle { radius: f64 },
        Square { side: f64 },
    }

    impl LinkKind for Shape {
        const TABLE: &'static str = "shape";
        fn type_tag(&self) -> &'static str {
            match self {
                Self::Circle { .. } => "circle",
                Self::Square { .. } => "square",
            }
        }
    }

    #[test]
    fn test_fill_is_idempotent_and_typed() {
        let catalog = Catalog::new();
        let a = Link::fill(&catalog, Shape::Circle { radius: 1.0 }).unwrap();
        let b = Link::fill(&catalog, Shape::Circle { radius: 1.0 }).unwrap();
        let c = Link::fill(&catalog, Shape::Square { side: 1.0 }).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let row = catalog.fetch1::<Link<Shape>>(&c).unwrap();
        assert_eq!(row.type_tag, "square");
        assert_eq!(Link::<Shape>::get(&catalog, &a).unwrap(), Shape::Circle { radius: 1.0 });
    }

    #[test]
    fn test_unknown_id_is_missing() {
        let catalog = Catalog::new();
        assert!(Link::<Shape>::get(&catalog, "deadbeef").unwrap_err().is_missing());
    }
}
