//! Distributed training
//!
//! ## Overview
//!
//! ```text
//! Model (data_id, network_id, instance_id)      Computed
//!   └── train()
//!         ├── rank 0 ─┐
//!         ├── rank 1 ─┼── ProcessGroup collectives (core.* over the world,
//!         └── ...    ─┘   everything else within the data group)
//!               └── Epochs ── ModelInfo / ModelCheckpoint ── ModelDone
//! ```
//!
//! An [`Instance`] fixes the plan, cycle, seed, transfers and the
//! scheduler, optimizer, loader and objective link ids. Cycle `c > 0` of an
//! instance starts from the final parameters of cycle `c - 1`.

pub mod distributed;
pub mod loader;
pub mod objective;
pub mod optimizer;
mod orchestrator;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod fixtures;

pub use distributed::{LocalGroup, LocalWorld, ParameterGroups, ProcessGroup, RankLayout, Rendezvous};
pub use loader::{LoaderKind, RandomBatches, TrialData};
pub use objective::{NetworkLoss, ObjectiveKind};
pub use optimizer::{Epoch, EpochRun, Epochs, OptimizerKind, OptimizerState, SgdClip};
pub use orchestrator::{initial_parameters, train, TrainOptions};
pub use scheduler::{CosineLr, SchedulerKind};

use serde::{Deserialize, Serialize};

use crate::catalog::{content_id, Computed, Entity, Link, LinkKind};
use crate::dataset::Dataset;
use crate::network::{NetworkKind, StateDict};
use crate::progress::{ModelDone, ModelKey, ProgressStore};
use crate::workspace::Workspace;
use crate::{Error, Result};

/// How ranks are laid out over data ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Plan {
    /// One data id, `parallel` ranks
    Individual {
        /// Ranks
        parallel: usize,
    },
    /// Shared core over several data ids, `parallel` ranks each
    Foundation {
        /// Ranks per data id
        parallel: usize,
        /// Data ids trained together
        data_ids: Vec<String>,
    },
}

impl Plan {
    /// Ranks per data id
    #[must_use]
    pub const fn parallel(&self) -> usize {
        match self {
            Self::Individual { parallel } | Self::Foundation { parallel, .. } => *parallel,
        }
    }
}

/// When transferred modules are frozen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FreezePolicy {
    /// Keep training the transferred modules
    Never,
    /// Freeze during cycle 0 only
    FirstCycle,
    /// Freeze in every cycle
    AllCycles,
}

impl FreezePolicy {
    /// Whether transferred modules are frozen in `cycle`
    #[must_use]
    pub const fn frozen(self, cycle: usize) -> bool {
        match self {
            Self::Never => false,
            Self::FirstCycle => cycle == 0,
            Self::AllCycles => true,
        }
    }
}

/// Parameters copied from a done foundation model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Foundation instance to copy from
    pub instance_id: String,
    /// Parameter-name prefixes to copy, e.g. `core.`
    pub modules: Vec<String>,
    /// Freezing of the copied modules
    pub freeze: FreezePolicy,
}

/// Training instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Rank layout
    pub plan: Plan,
    /// Training cycle, 0-based
    pub cycle: usize,
    /// Seed of network init and batch sampling
    pub seed: u64,
    /// Transfers applied after init
    pub transfers: Vec<Transfer>,
    /// Scheduler link id
    pub scheduler_id: String,
    /// Optimizer link id
    pub optimizer_id: String,
    /// Loader link id
    pub loader_id: String,
    /// Objective link id
    pub objective_id: String,
}

impl LinkKind for Instance {
    const TABLE: &'static str = "instance";

    fn type_tag(&self) -> &'static str {
        match self.plan {
            Plan::Individual { .. } => "individual",
            Plan::Foundation { .. } => "foundation",
        }
    }
}

impl Instance {
    /// The same instance one cycle earlier, `None` in cycle 0
    #[must_use]
    pub fn previous(&self) -> Option<Self> {
        self.cycle.checked_sub(1).map(|cycle| Self {
            cycle,
            ..self.clone()
        })
    }

    /// The same instance one cycle later
    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            cycle: self.cycle + 1,
            ..self.clone()
        }
    }

    /// Data ids trained together with `data_id`.
    ///
    /// # Errors
    /// Returns `Restriction` if a foundation plan does not list `data_id`
    pub fn data_ids(&self, data_id: &str) -> Result<Vec<String>> {
        match &self.plan {
            Plan::Individual { .. } => Ok(vec![data_id.to_string()]),
            Plan::Foundation { data_ids, .. } => {
                if data_ids.iter().any(|id| id == data_id) {
                    Ok(data_ids.clone())
                } else {
                    Err(Error::Restriction(format!(
                        "data id {data_id} is not part of the foundation plan"
                    )))
                }
            }
        }
    }
}

/// Final parameters of a trained model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    /// Key
    pub key: ModelKey,
    /// Epochs trained
    pub epochs: usize,
    /// Blob key of the parameters
    pub parameters_key: String,
}

impl Entity for Model {
    const TABLE: &'static str = "model";
    type Key = ModelKey;

    fn key(&self) -> ModelKey {
        self.key.clone()
    }
}

impl Model {
    /// Decode the parameters.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if the blob is absent
    pub fn parameters(&self, ws: &Workspace) -> Result<StateDict> {
        let bytes = ws
            .blobs()
            .get(&self.parameters_key)?
            .ok_or_else(|| Error::MissingUpstream(format!("blob `{}` not found", self.parameters_key)))?;
        StateDict::from_bytes(&bytes)
    }

    /// Build the row of a done model.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if the model is not done
    pub fn from_progress(ws: &Workspace, key: &ModelKey) -> Result<Self> {
        let store = ProgressStore::new(ws);
        let done = ws.fetch1::<ModelDone>(key)?;
        let parameters = store.final_parameters(key)?;
        let parameters_key = format!("models/{}/parameters.pt", content_id(key)?);
        ws.blobs().set(&parameters_key, parameters.to_bytes()?)?;
        Ok(Self {
            key: key.clone(),
            epochs: done.epoch() + 1,
            parameters_key,
        })
    }
}

impl Computed for Model {
    fn key_source(ws: &Workspace) -> Result<Vec<ModelKey>> {
        let datasets = ws.table::<Dataset>()?.keys();
        let networks = ws.table::<Link<NetworkKind>>()?.keys();
        let mut keys = Vec::new();
        for row in ws.table::<Link<Instance>>()?.rows() {
            let data_ids = match &row.variant.plan {
                Plan::Individual { .. } => datasets.clone(),
                Plan::Foundation { data_ids, .. } => data_ids
                    .iter()
                    .filter(|id| datasets.contains(id))
                    .cloned()
                    .collect(),
            };
            for network_id in &networks {
                keys.extend(
                    data_ids
                        .iter()
                        .map(|data_id| ModelKey::new(data_id.clone(), network_id.clone(), row.id.clone())),
                );
            }
        }
        Ok(keys)
    }

    fn make(ws: &Workspace, key: &ModelKey) -> Result<Self> {
        if !ProgressStore::new(ws).is_done(key)? {
            train(ws, key, &TrainOptions::from_settings(ws.settings()))?;
        }
        Self::from_progress(ws, key)
    }
}

/// Fetch the blob-backed parameters of a populated model.
///
/// # Errors
/// Returns `MissingUpstream` if the model row or blob is absent
pub fn model_parameters(ws: &Workspace, key: &ModelKey) -> Result<StateDict> {
    ws.fetch1::<Model>(key)?.parameters(ws)
}
