//! Terminal marker of a trained model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ModelKey;
use crate::catalog::Entity;

/// Written once every rank has checkpointed the final epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDone {
    model: ModelKey,
    world_size: usize,
    epoch: usize,
    done_at: DateTime<Utc>,
}

impl Entity for ModelDone {
    const TABLE: &'static str = "model_done";
    type Key = ModelKey;

    fn key(&self) -> ModelKey {
        self.model.clone()
    }
}

impl ModelDone {
    /// Marker stamped now
    #[must_use]
    pub fn new(model: ModelKey, world_size: usize, epoch: usize) -> Self {
        Self {
            model,
            world_size,
            epoch,
            done_at: Utc::now(),
        }
    }

    /// Model
    #[must_use]
    pub const fn model(&self) -> &ModelKey {
        &self.model
    }

    /// Ranks that trained the model
    #[must_use]
    pub const fn world_size(&self) -> usize {
        self.world_size
    }

    /// Final epoch
    #[must_use]
    pub const fn epoch(&self) -> usize {
        self.epoch
    }

    /// Completion time
    #[must_use]
    pub const fn done_at(&self) -> DateTime<Utc> {
        self.done_at
    }
}
