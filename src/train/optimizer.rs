//! Optimizers and the epoch loop
//!
//! [`Epochs`] is the training loop: each item is one finished epoch with
//! its info, the optimizer checkpoint and the parameters to persist.

use serde::{Deserialize, Serialize};

use super::distributed::{ParameterGroups, ProcessGroup};
use super::loader::RandomBatches;
use super::objective::NetworkLoss;
use super::scheduler::CosineLr;
use crate::catalog::LinkKind;
use crate::network::{Network, StateDict, Tensor};
use crate::progress::EpochInfo;
use crate::{Error, Result};

/// Optimizer variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// SGD with momentum and adaptive gradient clipping
    SgdClip {
        /// Momentum coefficient
        momentum: f64,
        /// Weight decay
        weight_decay: f64,
        /// Maximum gradient-to-parameter norm ratio
        clip: f64,
        /// Floor of the parameter norm
        eps: f64,
    },
}

impl LinkKind for OptimizerKind {
    const TABLE: &'static str = "optimizer";

    fn type_tag(&self) -> &'static str {
        "sgd_clip"
    }
}

impl OptimizerKind {
    /// Resolve the variant.
    ///
    /// # Errors
    /// Returns `InvalidInput` for momentum outside `[0, 1)` or a
    /// non-positive clip or eps
    pub fn build(&self) -> Result<SgdClip> {
        let Self::SgdClip {
            momentum,
            weight_decay,
            clip,
            eps,
        } = *self;
        if !(0.0..1.0).contains(&momentum) || !(clip > 0.0) || !(eps > 0.0) || weight_decay < 0.0 {
            return Err(Error::InvalidInput(format!(
                "invalid SgdClip(momentum={momentum}, weight_decay={weight_decay}, clip={clip}, eps={eps})"
            )));
        }
        Ok(SgdClip {
            momentum,
            weight_decay,
            clip,
            eps,
        })
    }
}

/// Optimizer state carried across epochs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    /// Updates applied so far
    pub steps: u64,
    /// Momentum buffers of the trainable parameters
    pub momentum: StateDict,
}

/// Resolved [`OptimizerKind::SgdClip`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdClip {
    momentum: f64,
    weight_decay: f64,
    clip: f64,
    eps: f64,
}

impl SgdClip {
    /// Update the `names` parameters in place; returns how many gradients
    /// were clipped.
    ///
    /// A gradient whose norm exceeds `clip · max(‖w‖, eps)` is rescaled to
    /// that norm before decay and momentum are applied.
    ///
    /// # Errors
    /// Returns `InvalidInput` if a name is missing from the parameters or gradients
    #[allow(clippy::cast_possible_truncation)]
    pub fn step<'n>(
        &self,
        parameters: &mut StateDict,
        grads: &StateDict,
        names: impl IntoIterator<Item = &'n String>,
        lr: f64,
        state: &mut OptimizerState,
    ) -> Result<usize> {
        let mut clipped = 0;
        for name in names {
            let weight = parameters
                .get_mut(name)
                .ok_or_else(|| Error::InvalidInput(format!("parameter `{name}` not found")))?;
            let grad = grads.require(name)?;
            let limit = self.clip * weight.norm().max(self.eps);
            let norm = grad.norm();
            let scale = if norm > limit {
                clipped += 1;
                limit / norm
            } else {
                1.0
            };

            if state.momentum.get(name).is_none() {
                state.momentum.insert(name.clone(), Tensor::zeros(&weight.shape));
            }
            let buffer = state
                .momentum
                .get_mut(name)
                .ok_or_else(|| Error::InvalidInput(format!("momentum `{name}` not found")))?;
            let (momentum, decay, scale, lr) = (
                self.momentum as f32,
                self.weight_decay as f32,
                scale as f32,
                lr as f32,
            );
            for ((w, g), v) in weight.data.iter_mut().zip(&grad.data).zip(buffer.data.iter_mut()) {
                let update = g * scale + decay * *w;
                *v = momentum * *v + update;
                *w -= lr * *v;
            }
        }
        state.steps += 1;
        Ok(clipped)
    }

    /// Epoch loop starting at `start_epoch` with `state`.
    #[must_use]
    pub fn epochs<'a>(self, run: EpochRun<'a>, start_epoch: usize, state: OptimizerState) -> Epochs<'a> {
        Epochs {
            optimizer: self,
            run,
            state,
            epoch: start_epoch,
            failed: false,
        }
    }
}

/// Everything one rank's epoch loop borrows
pub struct EpochRun<'a> {
    /// Network being trained
    pub network: &'a mut dyn Network,
    /// Learning-rate schedule
    pub scheduler: CosineLr,
    /// Loaded trials
    pub loader: &'a RandomBatches,
    /// Objective
    pub objective: NetworkLoss,
    /// Trainable parameter groups
    pub groups: &'a ParameterGroups,
    /// All ranks
    pub world: &'a dyn ProcessGroup,
    /// Ranks of this data id
    pub data: &'a dyn ProcessGroup,
}

/// One finished epoch
#[derive(Debug, Clone, PartialEq)]
pub struct Epoch {
    /// 0-based epoch
    pub epoch: usize,
    /// Losses and rates
    pub info: EpochInfo,
    /// Optimizer state after the epoch
    pub checkpoint: OptimizerState,
    /// Parameters after the epoch
    pub parameters: StateDict,
}

/// Iterator over the remaining epochs of a schedule.
///
/// Stops after the first error.
pub struct Epochs<'a> {
    optimizer: SgdClip,
    run: EpochRun<'a>,
    state: OptimizerState,
    epoch: usize,
    failed: bool,
}

impl Epochs<'_> {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn run_epoch(&mut self) -> Result<Epoch> {
        let run = &mut self.run;
        let lr = run.scheduler.lr(self.epoch);
        let mut plan = run.loader.epoch(self.epoch);
        let training = run.loader.training();

        let mut losses = 0.0;
        let mut clipped = 0usize;
        let mut updates = 0usize;
        for batch in &plan.batches {
            let trials: Vec<_> = batch.iter().map(|&i| &training[i]).collect();
            let (loss, mut grads) = run.objective.batch(&*run.network, &trials, &mut plan.rng)?;
            run.groups.sync(&mut grads, run.world, run.data)?;
            clipped += self.optimizer.step(
                run.network.parameters_mut(),
                &grads,
                run.groups.trainable(),
                lr,
                &mut self.state,
            )?;
            updates += run.groups.trainable().count();
            losses += loss;
        }

        let mut summary = [(losses / plan.batches.len().max(1) as f64) as f32];
        run.data.all_reduce_mean(&mut summary)?;
        let validation_loss = run.objective.evaluate(&*run.network, run.loader.validation())?;

        let epoch = Epoch {
            epoch: self.epoch,
            info: EpochInfo::new(
                f64::from(summary[0]),
                validation_loss,
                lr,
                clipped as f64 / updates.max(1) as f64,
            ),
            checkpoint: self.state.clone(),
            parameters: run.network.parameters().clone(),
        };
        tracing::debug!(
            epoch = self.epoch,
            rank = run.world.rank(),
            training_loss = epoch.info.training_loss,
            lr,
            "epoch finished"
        );
        self.epoch += 1;
        Ok(epoch)
    }
}

impl Iterator for Epochs<'_> {
    type Item = Result<Epoch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.epoch >= self.run.scheduler.epochs() {
            return None;
        }
        let result = self.run_epoch();
        self.failed = result.is_err();
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sgd(clip: f64) -> SgdClip {
        OptimizerKind::SgdClip {
            momentum: 0.5,
            weight_decay: 0.0,
            clip,
            eps: 1e-3,
        }
        .build()
        .unwrap()
    }

    fn single(value: f32) -> StateDict {
        let mut p = StateDict::new();
        p.insert("w", Tensor { shape: vec![1], data: vec![value] });
        p
    }

    #[test]
    fn test_momentum_accumulates() {
        let mut params = single(1.0);
        let grads = single(0.1);
        let names = vec!["w".to_string()];
        let mut state = OptimizerState::default();
        let opt = sgd(10.0);

        opt.step(&mut params, &grads, &names, 1.0, &mut state).unwrap();
        assert!((params.get("w").unwrap().data[0] - 0.9).abs() < 1e-6);
        opt.step(&mut params, &grads, &names, 1.0, &mut state).unwrap();
        // v = 0.5 * 0.1 + 0.1
        assert!((params.get("w").unwrap().data[0] - 0.75).abs() < 1e-6);
        assert_eq!(state.steps, 2);
    }

    #[test]
    fn test_adaptive_clipping() {
        let mut params = single(1.0);
        let grads = single(5.0);
        let names = vec!["w".to_string()];
        let mut state = OptimizerState::default();
        let clipped = sgd(0.1).step(&mut params, &grads, &names, 1.0, &mut state).unwrap();
        assert_eq!(clipped, 1);
        assert!((params.get("w").unwrap().data[0] - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let kind = OptimizerKind::SgdClip {
            momentum: 1.0,
            weight_decay: 0.0,
            clip: 0.1,
            eps: 1e-3,
        };
        assert!(kind.build().is_err());
    }
}
