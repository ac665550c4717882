//! Compressed blob store wrapper
//!
//! Resampled trace caches are dominated by smooth float series and video
//! frames, both of which compress well. Every payload carries a one-byte
//! algorithm tag so a cache written with one setting stays readable after
//! the setting changes.

use super::BlobStore;
use crate::{Error, Result};

const TAG_RAW: u8 = 0;
const TAG_LZ4: u8 = 1;
const TAG_ZSTD: u8 = 2;

/// Compression algorithm for blob payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// LZ4, fast (default)
    #[default]
    Lz4,
    /// ZSTD, better ratio
    Zstd,
}

impl Compression {
    /// Algorithm name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }

    const fn tag(self) -> u8 {
        match self {
            Self::Lz4 => TAG_LZ4,
            Self::Zstd => TAG_ZSTD,
        }
    }

    /// Encode a payload into a tagged frame.
    ///
    /// # Errors
    /// Returns error if the ZSTD encoder fails
    pub fn encode(self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(vec![TAG_RAW]);
        }
        let body = match self {
            Self::Lz4 => lz4_flex::compress_prepend_size(data),
            Self::Zstd => zstd::encode_all(data, 3)
                .map_err(|e| Error::StorageError(format!("ZSTD compression failed: {e}")))?,
        };
        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(self.tag());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a tagged frame written by [`Compression::encode`].
    ///
    /// # Errors
    /// Returns error on an unknown tag or corrupted body
    pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
        let (&tag, body) = frame
            .split_first()
            .ok_or_else(|| Error::StorageError("empty compressed frame".to_string()))?;
        match tag {
            TAG_RAW => Ok(body.to_vec()),
            TAG_LZ4 => lz4_flex::decompress_size_prepended(body)
                .map_err(|e| Error::StorageError(format!("LZ4 decompression failed: {e}"))),
            TAG_ZSTD => zstd::decode_all(body)
                .map_err(|e| Error::StorageError(format!("ZSTD decompression failed: {e}"))),
            other => Err(Error::StorageError(format!(
                "unknown compression tag {other}"
            ))),
        }
    }
}

/// Blob store that compresses payloads before handing them to `inner`.
#[derive(Debug)]
pub struct CompressedBlobStore<S: BlobStore> {
    inner: S,
    compression: Compression,
}

impl<S: BlobStore> CompressedBlobStore<S> {
    /// Wrap `inner` with the given algorithm.
    #[must_use]
    pub const fn new(inner: S, compression: Compression) -> Self {
        Self { inner, compression }
    }

    /// Wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: BlobStore> BlobStore for CompressedBlobStore<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner
            .get(key)?
            .map(|frame| Compression::decode(&frame))
            .transpose()
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let frame = self.compression.encode(&value)?;
        self.inner.set(key, frame)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    #[test]
    fn test_frames_are_self_describing() {
        let data: Vec<u8> = (0..4096u32).flat_map(|i| (i as f32).to_le_bytes()).collect();
        for compression in [Compression::Lz4, Compression::Zstd] {
            let frame = compression.encode(&data).unwrap();
            assert_eq!(Compression::decode(&frame).unwrap(), data);
        }
    }

    #[test]
    fn test_empty_payload() {
        let frame = Compression::Zstd.encode(&[]).unwrap();
        assert_eq!(frame, vec![TAG_RAW]);
        assert!(Compression::decode(&frame).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(Compression::decode(&[9, 1, 2]).is_err());
        assert!(Compression::decode(&[]).is_err());
    }

    #[test]
    fn test_store_reads_across_settings() {
        let lz4 = CompressedBlobStore::new(MemoryBlobStore::new(), Compression::Lz4);
        let frames = vec![0u8; 10_000];
        lz4.set("video/frames.bin", frames.clone()).unwrap();

        let stored = lz4.inner().get("video/frames.bin").unwrap().unwrap();
        assert!(stored.len() < frames.len() / 10);

        let zstd = CompressedBlobStore::new(MemoryBlobStore::new(), Compression::Zstd);
        zstd.inner().set("video/frames.bin", stored).unwrap();
        assert_eq!(zstd.get("video/frames.bin").unwrap(), Some(frames));
    }
}
