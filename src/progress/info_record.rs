//! Per-epoch training info

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ModelKey;
use crate::catalog::Entity;

/// Summary of one training epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochInfo {
    /// Mean training loss over the epoch's batches
    pub training_loss: f64,
    /// Validation loss, `None` without validation trials
    pub validation_loss: Option<f64>,
    /// Learning rate used for the epoch
    pub lr: f64,
    /// Fraction of parameter updates that were clipped
    pub clipped: f64,
}

impl EpochInfo {
    /// Build an info value
    #[must_use]
    pub const fn new(training_loss: f64, validation_loss: Option<f64>, lr: f64, clipped: f64) -> Self {
        Self {
            training_loss,
            validation_loss,
            lr,
            clipped,
        }
    }
}

/// Info row for one epoch of one model.
///
/// Rows are keyed by `(model, epoch)` and ordered by epoch when queried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    model: ModelKey,
    epoch: usize,
    info: EpochInfo,
    recorded_at: DateTime<Utc>,
}

impl Entity for ModelInfo {
    const TABLE: &'static str = "model_info";
    type Key = (ModelKey, usize);

    fn key(&self) -> Self::Key {
        (self.model.clone(), self.epoch)
    }
}

impl ModelInfo {
    /// Create an info row stamped now.
    #[must_use]
    pub fn new(model: ModelKey, epoch: usize, info: EpochInfo) -> Self {
        ModelInfoBuilder::new(model, epoch, info).build()
    }

    /// Builder with optional fields
    #[must_use]
    pub fn builder(model: ModelKey, epoch: usize, info: EpochInfo) -> ModelInfoBuilder {
        ModelInfoBuilder::new(model, epoch, info)
    }

    /// Model
    #[must_use]
    pub const fn model(&self) -> &ModelKey {
        &self.model
    }

    /// Epoch
    #[must_use]
    pub const fn epoch(&self) -> usize {
        self.epoch
    }

    /// Epoch summary
    #[must_use]
    pub const fn info(&self) -> &EpochInfo {
        &self.info
    }

    /// Wall-clock time the row was recorded
    #[must_use]
    pub const fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

/// Builder for `ModelInfo`.
#[derive(Debug)]
pub struct ModelInfoBuilder {
    model: ModelKey,
    epoch: usize,
    info: EpochInfo,
    recorded_at: DateTime<Utc>,
}

impl ModelInfoBuilder {
    /// Create a builder with required fields.
    #[must_use]
    pub fn new(model: ModelKey, epoch: usize, info: EpochInfo) -> Self {
        Self {
            model,
            epoch,
            info,
            recorded_at: Utc::now(),
        }
    }

    /// Set a custom timestamp.
    #[must_use]
    pub const fn recorded_at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }

    /// Build the `ModelInfo`.
    #[must_use]
    pub fn build(self) -> ModelInfo {
        ModelInfo {
            model: self.model,
            epoch: self.epoch,
            info: self.info,
            recorded_at: self.recorded_at,
        }
    }
}
