//! Checkpoint Record - latest epoch state of one rank

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ModelKey;
use crate::catalog::{content_id, Entity};
use crate::Result;

/// Latest checkpoint of one rank of one model.
///
/// At most one row exists per `(model, rank)`; a newer epoch replaces the
/// row. Payloads are stored under per-epoch blob keys so the previous
/// epoch's payload stays readable until the row points elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    model: ModelKey,
    rank: usize,
    epoch: usize,
    optimizer_key: String,
    parameters_key: String,
    parameters_hash: String,
    #[serde(default)]
    device: Option<usize>,
    saved_at: DateTime<Utc>,
}

impl Entity for ModelCheckpoint {
    const TABLE: &'static str = "model_checkpoint";
    type Key = (ModelKey, usize);

    fn key(&self) -> Self::Key {
        (self.model.clone(), self.rank)
    }
}

impl ModelCheckpoint {
    /// Builder with required fields
    #[must_use]
    pub fn builder(model: ModelKey, rank: usize, epoch: usize) -> ModelCheckpointBuilder {
        ModelCheckpointBuilder::new(model, rank, epoch)
    }

    /// Blob key prefix for `(model, rank, epoch)`.
    ///
    /// # Errors
    /// Returns error if the key cannot be hashed
    pub fn blob_prefix(model: &ModelKey, rank: usize, epoch: usize) -> Result<String> {
        Ok(format!("checkpoints/{}/{rank}/{epoch}", content_id(model)?))
    }

    /// Model
    #[must_use]
    pub const fn model(&self) -> &ModelKey {
        &self.model
    }

    /// Rank within the model's data group
    #[must_use]
    pub const fn rank(&self) -> usize {
        self.rank
    }

    /// Epoch of the stored state
    #[must_use]
    pub const fn epoch(&self) -> usize {
        self.epoch
    }

    /// Blob key of the optimizer state
    #[must_use]
    pub fn optimizer_key(&self) -> &str {
        &self.optimizer_key
    }

    /// Blob key of the parameters
    #[must_use]
    pub fn parameters_key(&self) -> &str {
        &self.parameters_key
    }

    /// `blake3:<hex>` of the parameter payload
    #[must_use]
    pub fn parameters_hash(&self) -> &str {
        &self.parameters_hash
    }

    /// CUDA device the rank was bound to, `None` on CPU
    #[must_use]
    pub const fn device(&self) -> Option<usize> {
        self.device
    }

    /// When the checkpoint was saved
    #[must_use]
    pub const fn saved_at(&self) -> DateTime<Utc> {
        self.saved_at
    }
}

/// Builder for `ModelCheckpoint`.
#[derive(Debug)]
pub struct ModelCheckpointBuilder {
    model: ModelKey,
    rank: usize,
    epoch: usize,
    optimizer_key: String,
    parameters_key: String,
    parameters_hash: String,
    device: Option<usize>,
    saved_at: DateTime<Utc>,
}

impl ModelCheckpointBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(model: ModelKey, rank: usize, epoch: usize) -> Self {
        Self {
            model,
            rank,
            epoch,
            optimizer_key: String::new(),
            parameters_key: String::new(),
            parameters_hash: String::new(),
            device: None,
            saved_at: Utc::now(),
        }
    }

    /// Set the optimizer blob key.
    #[must_use]
    pub fn optimizer_key(mut self, key: impl Into<String>) -> Self {
        self.optimizer_key = key.into();
        self
    }

    /// Set the parameter blob key and its content hash.
    #[must_use]
    pub fn parameters(mut self, key: impl Into<String>, hash: impl Into<String>) -> Self {
        self.parameters_key = key.into();
        self.parameters_hash = hash.into();
        self
    }

    /// Set the device the rank ran on.
    #[must_use]
    pub const fn device(mut self, device: Option<usize>) -> Self {
        self.device = device;
        self
    }

    /// Set a custom timestamp.
    #[must_use]
    pub const fn saved_at(mut self, saved_at: DateTime<Utc>) -> Self {
        self.saved_at = saved_at;
        self
    }

    /// Build the `ModelCheckpoint`.
    #[must_use]
    pub fn build(self) -> ModelCheckpoint {
        ModelCheckpoint {
            model: self.model,
            rank: self.rank,
            epoch: self.epoch,
            optimizer_key: self.optimizer_key,
            parameters_key: self.parameters_key,
            parameters_hash: self.parameters_hash,
            device: self.device,
            saved_at: self.saved_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_keyed_by_rank() {
        let model = ModelKey::new("d", "n", "i");
        let a = ModelCheckpoint::builder(model.clone(), 0, 4).build();
        let b = ModelCheckpoint::builder(model.clone(), 0, 5).build();
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), ModelCheckpoint::builder(model, 1, 4).build().key());
    }

    #[test]
    fn test_blob_prefix_is_deterministic() {
        let model = ModelKey::new("d", "n", "i");
        let a = ModelCheckpoint::blob_prefix(&model, 1, 2).unwrap();
        assert_eq!(a, ModelCheckpoint::blob_prefix(&model, 1, 2).unwrap());
        assert!(a.ends_with("/1/2"));
    }
}
