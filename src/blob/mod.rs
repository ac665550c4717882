//! Content-addressed blob store for cached arrays and checkpoints
//!
//! Keys are deterministic functions of catalog row keys, so two workers
//! producing the same row write byte-identical blobs to the same key.
//!
//! # Example
//!
//! ```rust
//! use foundation::blob::{BlobStore, MemoryBlobStore};
//!
//! # fn example() -> foundation::Result<()> {
//! let store = MemoryBlobStore::new();
//! store.set("traces/abc.bin", b"payload".to_vec())?;
//! assert_eq!(store.get("traces/abc.bin")?, Some(b"payload".to_vec()));
//!
//! store.delete("traces/abc.bin")?;
//! assert!(!store.exists("traces/abc.bin")?);
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "compression")]
mod compressed;
mod fs;
mod memory;

#[cfg(feature = "compression")]
pub use compressed::{Compression, CompressedBlobStore};
pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, Result};

/// Key-value blob storage.
///
/// `set` is an atomic replace: readers observe either the old or the new
/// payload, never a partial write.
pub trait BlobStore: Send + Sync {
    /// Get a blob by key, `None` if absent.
    ///
    /// # Errors
    /// Returns error if the backend cannot be read
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a blob, replacing any existing payload.
    ///
    /// # Errors
    /// Returns error if the backend cannot be written
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete a blob; no-op if absent.
    ///
    /// # Errors
    /// Returns error if the backend cannot be written
    fn delete(&self, key: &str) -> Result<()>;

    /// Check whether a blob exists.
    ///
    /// # Errors
    /// Returns error if the backend cannot be read
    fn exists(&self, key: &str) -> Result<bool>;

    /// Get several blobs; results follow the order of `keys`.
    ///
    /// # Errors
    /// Returns the first backend error
    fn batch_get(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Store several blobs.
    ///
    /// # Errors
    /// Returns the first backend error
    fn batch_set(&self, pairs: Vec<(&str, Vec<u8>)>) -> Result<()> {
        for (key, value) in pairs {
            self.set(key, value)?;
        }
        Ok(())
    }
}

/// Serialize `value` with bincode and store it under `key`.
///
/// # Errors
/// Returns error if encoding or the write fails
pub fn put<T: Serialize + ?Sized>(store: &dyn BlobStore, key: &str, value: &T) -> Result<()> {
    store.set(key, bincode::serialize(value)?)
}

/// Load and decode the blob under `key`.
///
/// # Errors
/// Returns `MissingUpstream` if the blob is absent, or a decoding error
pub fn fetch<T: DeserializeOwned>(store: &dyn BlobStore, key: &str) -> Result<T> {
    let bytes = store
        .get(key)?
        .ok_or_else(|| Error::MissingUpstream(format!("blob `{key}` not found")))?;
    Ok(bincode::deserialize(&bytes)?)
}

/// Content hash of a payload in `blake3:<hex>` form.
#[must_use]
pub fn cas_hash(bytes: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(bytes).to_hex())
}
