//! Filesystem blob store rooted at a configured directory.

use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use super::BlobStore;
use crate::{Error, Result};

/// Blob store writing one file per key under `root`.
///
/// Keys are relative `/`-separated paths. Writes land in a temporary file
/// in the target directory and are renamed into place.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open (and create if needed) a store rooted at `root`.
    ///
    /// # Errors
    /// Returns error if the root directory cannot be created
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(Error::StorageError(format!(
                "blob key must be a relative path without `..`: {key:?}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

impl BlobStore for FsBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path(key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path(key)?;
        let dir = path
            .parent()
            .ok_or_else(|| Error::StorageError(format!("blob key has no parent: {key:?}")))?;
        std::fs::create_dir_all(dir)?;

        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        staged.write_all(&value)?;
        staged.as_file().sync_all()?;
        staged.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path(key)?.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_roundtrip_nested_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();

        store.set("a/b/c.bin", vec![1, 2, 3]).unwrap();
        assert!(store.exists("a/b/c.bin").unwrap());
        assert_eq!(store.get("a/b/c.bin").unwrap(), Some(vec![1, 2, 3]));
        assert!(dir.path().join("a/b/c.bin").is_file());
    }

    #[test]
    fn test_fs_replace_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();

        store.set("k", vec![1]).unwrap();
        store.set("k", vec![2, 2]).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(vec![2, 2]));

        store.delete("k").unwrap();
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_fs_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();

        assert!(store.set("../outside", vec![0]).is_err());
        assert!(store.set("/abs", vec![0]).is_err());
        assert!(store.get("").is_err());
    }
}
