//! Trial loaders

use ndarray::Array2;
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::LinkKind;
use crate::dataset::{Channel, Dataset, DatasetTrial};
use crate::network::Inputs;
use crate::workspace::Workspace;
use crate::{Error, Result};

/// Loader variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LoaderKind {
    /// `batches` random batches of `batch_size` training trials per epoch
    RandomBatches {
        /// Trials per batch
        batch_size: usize,
        /// Batches per epoch
        batches: usize,
    },
}

impl LinkKind for LoaderKind {
    const TABLE: &'static str = "loader";

    fn type_tag(&self) -> &'static str {
        "random_batches"
    }
}

/// One trial, decoded for the network
#[derive(Debug, Clone, PartialEq)]
pub struct TrialData {
    /// Trial
    pub trial_id: String,
    /// Model inputs
    pub inputs: Inputs,
    /// Standardized unit responses, `[samples, units]`
    pub targets: Array2<f32>,
}

impl TrialData {
    /// Decode a dataset trial.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if a blob is absent
    pub fn load(ws: &Workspace, trial: &DatasetTrial) -> Result<Self> {
        Ok(Self {
            trial_id: trial.trial_id.clone(),
            inputs: Inputs::new(
                &trial.stimuli(ws)?,
                trial.channel(ws, Channel::Perspective)?,
                trial.channel(ws, Channel::Modulation)?,
            )?,
            targets: trial.channel(ws, Channel::Unit)?,
        })
    }
}

impl LoaderKind {
    /// Load a dataset for one rank.
    ///
    /// # Errors
    /// Returns `InvalidInput` for a zero batch size or batch count and
    /// `MissingTrial` when the dataset has no training trials
    pub fn build(&self, ws: &Workspace, dataset: &Dataset, seed: u64, local_rank: usize) -> Result<RandomBatches> {
        let Self::RandomBatches { batch_size, batches } = *self;
        if batch_size == 0 || batches == 0 {
            return Err(Error::InvalidInput(format!(
                "loader needs batch_size > 0 and batches > 0, got {batch_size} and {batches}"
            )));
        }
        let training = dataset
            .training()
            .map(|trial| TrialData::load(ws, trial))
            .collect::<Result<Vec<_>>>()?;
        if training.is_empty() {
            return Err(Error::MissingTrial(format!(
                "dataset {} has no training trials",
                dataset.data_id
            )));
        }
        let validation = dataset
            .validation()
            .map(|trial| TrialData::load(ws, trial))
            .collect::<Result<Vec<_>>>()?;
        Ok(RandomBatches {
            batch_size,
            batches,
            seed,
            local_rank,
            training,
            validation,
        })
    }
}

/// Batches and the RNG of one epoch
#[derive(Debug, Clone)]
pub struct EpochBatches {
    /// Training trial indices per batch
    pub batches: Vec<Vec<usize>>,
    /// Stream for further per-epoch draws
    pub rng: ChaCha8Rng,
}

/// Loaded trials with seeded batch sampling.
///
/// Batches depend only on `(seed, epoch, local_rank)`, so a resumed run
/// draws the same batches as an uninterrupted one.
#[derive(Debug, Clone)]
pub struct RandomBatches {
    batch_size: usize,
    batches: usize,
    seed: u64,
    local_rank: usize,
    training: Vec<TrialData>,
    validation: Vec<TrialData>,
}

impl RandomBatches {
    /// Training trials
    #[must_use]
    pub fn training(&self) -> &[TrialData] {
        &self.training
    }

    /// Validation trials
    #[must_use]
    pub fn validation(&self) -> &[TrialData] {
        &self.validation
    }

    /// Draw the batches of `epoch`.
    #[must_use]
    pub fn epoch(&self, epoch: usize) -> EpochBatches {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(((epoch as u64) << 16) | self.local_rank as u64);
        let amount = self.batch_size.min(self.training.len());
        let batches = (0..self.batches)
            .map(|_| index::sample(&mut rng, self.training.len(), amount).into_vec())
            .collect();
        EpochBatches { batches, rng }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::fixtures;

    #[test]
    fn test_batches_are_seeded_per_epoch_and_rank() {
        let ws = Workspace::in_memory();
        let dataset = fixtures::dataset(&ws, "data", 6, 2, 3);
        let loader = LoaderKind::RandomBatches { batch_size: 3, batches: 4 };

        let a = loader.build(&ws, &dataset, 7, 0).unwrap();
        let b = loader.build(&ws, &dataset, 7, 0).unwrap();
        let c = loader.build(&ws, &dataset, 7, 1).unwrap();
        assert_eq!(a.training().len(), 4);
        assert_eq!(a.validation().len(), 2);

        assert_eq!(a.epoch(2).batches, b.epoch(2).batches);
        assert_ne!(a.epoch(2).batches, a.epoch(3).batches);
        assert_ne!(a.epoch(2).batches, c.epoch(2).batches);
        for batch in a.epoch(0).batches {
            assert_eq!(batch.len(), 3);
            assert!(batch.iter().all(|&i| i < 4));
        }
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let ws = Workspace::in_memory();
        let dataset = fixtures::dataset(&ws, "data", 6, 2, 3);
        let loader = LoaderKind::RandomBatches { batch_size: 0, batches: 1 };
        assert!(loader.build(&ws, &dataset, 0, 0).is_err());
    }
}
