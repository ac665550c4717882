//! Training progress rows
//!
//! ## Schema Overview
//!
//! ```text
//! ModelKey (data_id, network_id, instance_id)
//!    ├──< ModelInfo (N)        one per epoch, main rank only [time-series]
//!    ├──< ModelCheckpoint (R)  latest epoch per rank, atomic replace
//!    └──  ModelDone (0..1)     terminal marker, written after every rank's
//!                              final checkpoint
//! ```
//!
//! Checkpoint payloads (optimizer state and parameters) live in the blob
//! store; rows carry their keys and content hashes.
//!
//! ## Usage
//!
//! ```rust
//! use foundation::progress::{EpochInfo, ModelKey, ProgressStore};
//! use foundation::workspace::Workspace;
//!
//! # fn example() -> foundation::Result<()> {
//! let ws = Workspace::in_memory();
//! let model = ModelKey::new("data", "network", "instance");
//! let store = ProgressStore::new(&ws);
//! store.record_info(&model, 0, EpochInfo::new(0.5, Some(0.6), 0.1, 0.0))?;
//! assert_eq!(store.info(&model)?.len(), 1);
//! # Ok(())
//! # }
//! ```

mod checkpoint_record;
mod done_record;
mod info_record;
mod store;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use checkpoint_record::{ModelCheckpoint, ModelCheckpointBuilder};
pub use done_record::ModelDone;
pub use info_record::{EpochInfo, ModelInfo, ModelInfoBuilder};
pub use store::ProgressStore;

/// Identity of a trained model
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    /// Dataset
    pub data_id: String,
    /// Network link id
    pub network_id: String,
    /// Instance link id
    pub instance_id: String,
}

impl ModelKey {
    /// Build a key
    #[must_use]
    pub fn new(
        data_id: impl Into<String>,
        network_id: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            data_id: data_id.into(),
            network_id: network_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.data_id, self.network_id, self.instance_id)
    }
}
