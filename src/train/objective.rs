//! Training objectives

use ndarray::{Array2, Zip};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::loader::TrialData;
use crate::catalog::LinkKind;
use crate::network::{Network, StateDict};
use crate::{Error, Result};

/// Objective variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectiveKind {
    /// Mean squared error over finite targets after `burnin_frames`
    NetworkLoss {
        /// Draw a random core stream per trial instead of stream 0
        sample_stream: bool,
        /// Leading samples excluded from the loss
        burnin_frames: usize,
    },
}

impl LinkKind for ObjectiveKind {
    const TABLE: &'static str = "objective";

    fn type_tag(&self) -> &'static str {
        "network_loss"
    }
}

impl ObjectiveKind {
    /// Sample-stream flag and burn-in
    #[must_use]
    pub const fn build(&self) -> NetworkLoss {
        let Self::NetworkLoss {
            sample_stream,
            burnin_frames,
        } = *self;
        NetworkLoss {
            sample_stream,
            burnin_frames,
        }
    }
}

/// Resolved [`ObjectiveKind::NetworkLoss`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkLoss {
    sample_stream: bool,
    burnin_frames: usize,
}

impl NetworkLoss {
    fn stream(&self, network: &dyn Network, rng: &mut ChaCha8Rng) -> usize {
        if self.sample_stream && network.streams() > 1 {
            rng.gen_range(0..network.streams())
        } else {
            0
        }
    }

    /// Masked residuals and the count of scored entries.
    #[allow(clippy::cast_precision_loss)]
    fn residual(&self, output: &Array2<f32>, targets: &Array2<f32>) -> Result<(Array2<f32>, usize)> {
        if output.dim() != targets.dim() {
            return Err(Error::InvalidInput(format!(
                "network output {:?} does not match targets {:?}",
                output.dim(),
                targets.dim()
            )));
        }
        let mut count = 0;
        let mut residual = Array2::<f32>::zeros(output.dim());
        Zip::indexed(&mut residual)
            .and(output)
            .and(targets)
            .for_each(|(row, _), r, &y, &t| {
                if row >= self.burnin_frames && t.is_finite() {
                    *r = y - t;
                    count += 1;
                }
            });
        Ok((residual, count))
    }

    /// Loss of one trial, `None` when no entry is scored.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the network rejects the inputs
    #[allow(clippy::cast_precision_loss)]
    pub fn loss(&self, network: &dyn Network, stream: usize, trial: &TrialData) -> Result<Option<f64>> {
        let output = network.forward(stream, &trial.inputs)?;
        let (residual, count) = self.residual(&output, &trial.targets)?;
        if count == 0 {
            return Ok(None);
        }
        let sum: f64 = residual.iter().map(|&r| f64::from(r) * f64::from(r)).sum();
        Ok(Some(sum / count as f64))
    }

    /// Mean loss and gradients over a batch of trials.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the network rejects the inputs
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn batch(
        &self,
        network: &dyn Network,
        trials: &[&TrialData],
        rng: &mut ChaCha8Rng,
    ) -> Result<(f64, StateDict)> {
        let mut grads = network.parameters().zeros_like();
        let mut total = 0.0;
        let mut scored = 0usize;
        for trial in trials {
            let stream = self.stream(network, rng);
            let output = network.forward(stream, &trial.inputs)?;
            let (residual, count) = self.residual(&output, &trial.targets)?;
            if count == 0 {
                continue;
            }
            total += residual.iter().map(|&r| f64::from(r) * f64::from(r)).sum::<f64>() / count as f64;
            let d_output = residual.mapv(|r| 2.0 * r / count as f32);
            let trial_grads = network.backward(stream, &trial.inputs, d_output.view())?;
            grads.add_scaled(&trial_grads, 1.0)?;
            scored += 1;
        }
        if scored == 0 {
            return Ok((0.0, grads));
        }
        let scale = 1.0 / scored as f64;
        let mut mean = grads.zeros_like();
        mean.add_scaled(&grads, scale)?;
        Ok((total * scale, mean))
    }

    /// Mean loss over `trials` on stream 0, `None` without scored trials.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the network rejects the inputs
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate(&self, network: &dyn Network, trials: &[TrialData]) -> Result<Option<f64>> {
        let losses = trials
            .iter()
            .map(|trial| self.loss(network, 0, trial))
            .collect::<Result<Vec<_>>>()?;
        let scored: Vec<f64> = losses.into_iter().flatten().collect();
        if scored.is_empty() {
            return Ok(None);
        }
        Ok(Some(scored.iter().sum::<f64>() / scored.len() as f64))
    }
}
