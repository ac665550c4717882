//! Learning-rate schedules

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::catalog::LinkKind;
use crate::{Error, Result};

/// Schedule variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerKind {
    /// Cosine annealing with warm restarts.
    ///
    /// The first training cycle opens with `burnin_cycles` short cycles of
    /// `burnin_epochs` epochs; later cycles skip them.
    CosineLr {
        /// Peak learning rate
        lr: f64,
        /// Epochs per cycle
        cycle_size: usize,
        /// Cycles
        cycles: usize,
        /// Epochs per burn-in cycle
        burnin_epochs: usize,
        /// Burn-in cycles
        burnin_cycles: usize,
    },
}

impl LinkKind for SchedulerKind {
    const TABLE: &'static str = "scheduler";

    fn type_tag(&self) -> &'static str {
        "cosine_lr"
    }
}

impl SchedulerKind {
    /// Schedule for training cycle `cycle`.
    ///
    /// # Errors
    /// Returns `InvalidInput` for a non-positive rate or an empty schedule
    pub fn build(&self, cycle: usize) -> Result<CosineLr> {
        let Self::CosineLr {
            lr,
            cycle_size,
            cycles,
            burnin_epochs,
            burnin_cycles,
        } = *self;
        if !(lr.is_finite() && lr > 0.0) {
            return Err(Error::InvalidInput(format!("learning rate must be positive, got {lr}")));
        }
        let (burnin_epochs, burnin_cycles) = if cycle == 0 {
            (burnin_epochs, burnin_cycles)
        } else {
            (0, 0)
        };
        let schedule = CosineLr {
            lr,
            cycle_size,
            cycles,
            burnin_epochs,
            burnin_cycles,
        };
        if schedule.epochs() == 0 {
            return Err(Error::InvalidInput("schedule has no epochs".to_string()));
        }
        Ok(schedule)
    }
}

/// Resolved cosine schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineLr {
    lr: f64,
    cycle_size: usize,
    cycles: usize,
    burnin_epochs: usize,
    burnin_cycles: usize,
}

impl CosineLr {
    /// Total epochs
    #[must_use]
    pub const fn epochs(&self) -> usize {
        self.burnin_epochs * self.burnin_cycles + self.cycle_size * self.cycles
    }

    /// Learning rate of `epoch` (0-based).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn lr(&self, epoch: usize) -> f64 {
        let burnin = self.burnin_epochs * self.burnin_cycles;
        let (position, length) = if epoch < burnin {
            (epoch % self.burnin_epochs, self.burnin_epochs)
        } else {
            ((epoch - burnin) % self.cycle_size.max(1), self.cycle_size.max(1))
        };
        self.lr * 0.5 * (1.0 + (PI * position as f64 / length as f64).cos())
    }
}
