//! Progress Store - checkpoint policy over the catalog and blob store
//!
//! Every write goes through the policy checks here: a rank's checkpoint
//! advances one epoch at a time, and resuming requires all ranks to agree
//! on the stored epoch.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{EpochInfo, ModelCheckpoint, ModelDone, ModelInfo, ModelKey};
use crate::blob::{self, cas_hash};
use crate::network::StateDict;
use crate::workspace::Workspace;
use crate::{Error, Result};

/// Progress rows of a workspace.
#[derive(Clone, Copy)]
pub struct ProgressStore<'a> {
    ws: &'a Workspace,
}

impl<'a> ProgressStore<'a> {
    /// Store over `ws`
    #[must_use]
    pub const fn new(ws: &'a Workspace) -> Self {
        Self { ws }
    }

    /// Record the info of `epoch`, replacing a row left by an interrupted run.
    ///
    /// # Errors
    /// Returns error if the table cannot be opened
    pub fn record_info(&self, model: &ModelKey, epoch: usize, info: EpochInfo) -> Result<()> {
        self.ws
            .table::<ModelInfo>()?
            .replace(ModelInfo::new(model.clone(), epoch, info));
        Ok(())
    }

    /// Info rows of `model`, ordered by epoch.
    ///
    /// # Errors
    /// Returns error if the table cannot be opened
    pub fn info(&self, model: &ModelKey) -> Result<Vec<ModelInfo>> {
        let mut rows = self.ws.table::<ModelInfo>()?.restrict(|row| row.model() == model);
        rows.sort_by_key(ModelInfo::epoch);
        Ok(rows)
    }

    /// Save one rank's state after `epoch`.
    ///
    /// Epoch 0 may only be written when the rank has no checkpoint yet; a
    /// later epoch requires the stored one to be exactly `epoch - 1`. The
    /// payloads are written before the row is replaced, and the previous
    /// epoch's payloads are removed afterwards. `device` is the CUDA device
    /// the rank is bound to.
    ///
    /// # Errors
    /// Returns `InconsistentCheckpoints` if the write breaks the epoch
    /// sequence or the model is already done
    pub fn save_checkpoint<S: Serialize>(
        &self,
        model: &ModelKey,
        rank: usize,
        epoch: usize,
        device: Option<usize>,
        optimizer: &S,
        parameters: &StateDict,
    ) -> Result<ModelCheckpoint> {
        if self.is_done(model)? {
            return Err(Error::InconsistentCheckpoints(format!(
                "model {model} is done; refusing epoch {epoch} of rank {rank}"
            )));
        }
        let table = self.ws.table::<ModelCheckpoint>()?;
        let previous = table.get(&(model.clone(), rank));
        match (&previous, epoch) {
            (None, 0) => {}
            (Some(prev), e) if e > 0 && prev.epoch() + 1 == e => {}
            (prev, e) => {
                return Err(Error::InconsistentCheckpoints(format!(
                    "rank {rank} of model {model}: stored epoch {:?}, writing {e}",
                    prev.as_ref().map(ModelCheckpoint::epoch)
                )))
            }
        }

        let prefix = ModelCheckpoint::blob_prefix(model, rank, epoch)?;
        let optimizer_key = format!("{prefix}/optimizer.bin");
        let parameters_key = format!("{prefix}/parameters.pt");
        let bytes = parameters.to_bytes()?;
        let hash = cas_hash(&bytes);
        let store = self.ws.blobs();
        blob::put(store, &optimizer_key, optimizer)?;
        store.set(&parameters_key, bytes)?;

        let row = ModelCheckpoint::builder(model.clone(), rank, epoch)
            .optimizer_key(optimizer_key)
            .parameters(parameters_key, hash)
            .device(device)
            .build();
        if let Some(old) = table.replace(row.clone()) {
            store.delete(old.optimizer_key())?;
            store.delete(old.parameters_key())?;
        }
        tracing::debug!(%model, rank, epoch, "checkpoint saved");
        Ok(row)
    }

    /// Epoch every rank has checkpointed, `None` for a fresh model.
    ///
    /// # Errors
    /// Returns `InconsistentCheckpoints` if the rank count differs from
    /// `world_size` or the ranks disagree on the epoch
    pub fn resume_epoch(&self, model: &ModelKey, world_size: usize) -> Result<Option<usize>> {
        let rows = self
            .ws
            .table::<ModelCheckpoint>()?
            .restrict(|row| row.model() == model);
        let Some(first) = rows.first() else {
            return Ok(None);
        };
        if rows.len() != world_size || rows.iter().any(|row| row.rank() >= world_size) {
            return Err(Error::InconsistentCheckpoints(format!(
                "model {model} has {} checkpoints for {world_size} ranks",
                rows.len()
            )));
        }
        let epoch = first.epoch();
        if let Some(other) = rows.iter().find(|row| row.epoch() != epoch) {
            return Err(Error::InconsistentCheckpoints(format!(
                "model {model}: rank {} is at epoch {epoch}, rank {} at epoch {}",
                first.rank(),
                other.rank(),
                other.epoch()
            )));
        }
        Ok(Some(epoch))
    }

    /// Load one rank's optimizer state and parameters.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if the checkpoint is absent and
    /// `InconsistentCheckpoints` if the parameter payload fails its hash
    pub fn load_checkpoint<S: DeserializeOwned>(
        &self,
        model: &ModelKey,
        rank: usize,
    ) -> Result<(ModelCheckpoint, S, StateDict)> {
        let row = self.ws.fetch1::<ModelCheckpoint>(&(model.clone(), rank))?;
        let optimizer = blob::fetch(self.ws.blobs(), row.optimizer_key())?;
        let parameters = self.parameters_of(&row)?;
        Ok((row, optimizer, parameters))
    }

    fn parameters_of(&self, row: &ModelCheckpoint) -> Result<StateDict> {
        let bytes = self
            .ws
            .blobs()
            .get(row.parameters_key())?
            .ok_or_else(|| Error::MissingUpstream(format!("blob `{}` not found", row.parameters_key())))?;
        if cas_hash(&bytes) != row.parameters_hash() {
            return Err(Error::InconsistentCheckpoints(format!(
                "parameters of rank {} of model {} fail their hash",
                row.rank(),
                row.model()
            )));
        }
        StateDict::from_bytes(&bytes)
    }

    /// Mark `model` done once every rank holds the same final checkpoint.
    ///
    /// # Errors
    /// Returns `InconsistentCheckpoints` if no consistent checkpoint set exists
    pub fn mark_done(&self, model: &ModelKey, world_size: usize) -> Result<ModelDone> {
        let epoch = self.resume_epoch(model, world_size)?.ok_or_else(|| {
            Error::InconsistentCheckpoints(format!("model {model} has no checkpoints"))
        })?;
        let done = ModelDone::new(model.clone(), world_size, epoch);
        self.ws.catalog().insert(done.clone())?;
        tracing::info!(%model, epoch, world_size, "model done");
        Ok(done)
    }

    /// Whether `model` is done.
    ///
    /// # Errors
    /// Returns error if the table cannot be opened
    pub fn is_done(&self, model: &ModelKey) -> Result<bool> {
        Ok(self.ws.table::<ModelDone>()?.contains(model))
    }

    /// Final parameters of a done model (rank 0's last checkpoint).
    ///
    /// # Errors
    /// Returns `MissingUpstream` if the model is not done
    pub fn final_parameters(&self, model: &ModelKey) -> Result<StateDict> {
        self.ws.fetch1::<ModelDone>(model)?;
        let row = self.ws.fetch1::<ModelCheckpoint>(&(model.clone(), 0))?;
        self.parameters_of(&row)
    }
}
