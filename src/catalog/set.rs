//! Set and list meta-entities
//!
//! A set hashes its sorted, deduplicated member ids; a list hashes its
//! members in the given order. Either way each member row carries an
//! `index` (sorted position for sets, list position for lists), and the
//! parent row is inserted last so its presence means the members are
//! complete.

use std::fmt::Debug;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use super::{content_id, Catalog, Entity};
use crate::{Error, Result};

/// Marker describing one set or list table pair.
pub trait SetKind: Clone + Debug + Default + PartialEq + Send + Sync + 'static {
    /// Parent table name
    const TABLE: &'static str;
    /// Member table name
    const MEMBER_TABLE: &'static str;
    /// `true` for a list (order significant, duplicates kept)
    const ORDERED: bool;
}

/// Parent row of a set or list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct LinkSet<K: SetKind> {
    /// Content id of the member ids
    pub id: String,
    /// Member count
    pub members: usize,
    #[serde(skip)]
    kind: PhantomData<K>,
}

/// Member row of a set or list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SetMember<K: SetKind> {
    /// Parent id
    pub id: String,
    /// Position (sorted for sets, given order for lists)
    pub index: usize,
    /// Member id
    pub member_id: String,
    #[serde(skip)]
    kind: PhantomData<K>,
}

impl<K: SetKind> Entity for LinkSet<K> {
    const TABLE: &'static str = K::TABLE;
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }
}

impl<K: SetKind> Entity for SetMember<K> {
    const TABLE: &'static str = K::MEMBER_TABLE;
    type Key = (String, usize);

    fn key(&self) -> (String, usize) {
        (self.id.clone(), self.index)
    }
}

impl<K: SetKind> LinkSet<K> {
    /// Canonical member order and id for `member_ids`.
    ///
    /// # Errors
    /// Returns `InvalidInput` for an empty member list
    pub fn identify<I, S>(member_ids: I) -> Result<(String, Vec<String>)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut members: Vec<String> = member_ids.into_iter().map(Into::into).collect();
        if members.is_empty() {
            return Err(Error::InvalidInput(format!(
                "`{}` cannot be empty",
                K::TABLE
            )));
        }
        if !K::ORDERED {
            members.sort();
            members.dedup();
        }
        let id = content_id(&(K::TABLE, &members))?;
        Ok((id, members))
    }

    /// Insert the set (idempotent) and return its id.
    ///
    /// # Errors
    /// Returns `InvalidInput` for an empty member list, or an insert error
    pub fn fill<I, S>(catalog: &Catalog, member_ids: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (id, members) = Self::identify(member_ids)?;
        let count = members.len();

        let member_table = catalog.table::<SetMember<K>>()?;
        member_table.insert_many(members.into_iter().enumerate().map(|(index, member_id)| {
            SetMember {
                id: id.clone(),
                index,
                member_id,
                kind: PhantomData,
            }
        }))?;
        catalog.insert(Self {
            id: id.clone(),
            members: count,
            kind: PhantomData,
        })?;
        Ok(id)
    }

    /// Member ids ordered by index.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if the set is unknown
    pub fn members(catalog: &Catalog, id: &str) -> Result<Vec<String>> {
        let parent = catalog.fetch1::<Self>(&id.to_string())?;
        let rows = catalog
            .table::<SetMember<K>>()?
            .restrict(|member| member.id == id);
        if rows.len() != parent.members {
            return Err(Error::StorageError(format!(
                "`{}` {id} lists {} members but {} rows exist",
                K::TABLE,
                parent.members,
                rows.len()
            )));
        }
        // restrict() is key-ordered, i.e. by (id, index)
        Ok(rows.into_iter().map(|member| member.member_id).collect())
    }

    /// Whether `member_id` belongs to set `id`.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if the set is unknown
    pub fn contains(catalog: &Catalog, id: &str, member_id: &str) -> Result<bool> {
        catalog.fetch1::<Self>(&id.to_string())?;
        Ok(!catalog
            .table::<SetMember<K>>()?
            .restrict(|member| member.id == id && member.member_id == member_id)
            .is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Bag;

    impl SetKind for Bag {
        const TABLE: &'static str = "bag";
        const MEMBER_TABLE: &'static str = "bag_member";
        const ORDERED: bool = false;
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Queue;

    impl SetKind for Queue {
        const TABLE: &'static str = "queue";
        const MEMBER_TABLE: &'static str = "queue_member";
        const ORDERED: bool = true;
    }

    #[test]
    fn test_set_is_order_independent_and_deduplicated() {
        let catalog = Catalog::new();
        let a = LinkSet::<Bag>::fill(&catalog, ["y", "x", "y"]).unwrap();
        let b = LinkSet::<Bag>::fill(&catalog, ["x", "y"]).unwrap();
        assert_eq!(a, b);
        assert_eq!(LinkSet::<Bag>::members(&catalog, &a).unwrap(), vec!["x", "y"]);
        assert_eq!(catalog.fetch1::<LinkSet<Bag>>(&a).unwrap().members, 2);
        assert!(LinkSet::<Bag>::contains(&catalog, &a, "x").unwrap());
        assert!(!LinkSet::<Bag>::contains(&catalog, &a, "z").unwrap());
    }

    #[test]
    fn test_list_keeps_order_and_duplicates() {
        let catalog = Catalog::new();
        let a = LinkSet::<Queue>::fill(&catalog, ["y", "x", "y"]).unwrap();
        let b = LinkSet::<Queue>::fill(&catalog, ["x", "y", "y"]).unwrap();
        assert_ne!(a, b);
        assert_eq!(
            LinkSet::<Queue>::members(&catalog, &a).unwrap(),
            vec!["y", "x", "y"]
        );
    }

    #[test]
    fn test_empty_set_rejected() {
        let catalog = Catalog::new();
        let empty: [&str; 0] = [];
        assert!(LinkSet::<Bag>::fill(&catalog, empty).is_err());
    }
}
