//! Deterministic training/validation split of trials

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::LinkKind;
use crate::params::positive;
use crate::{Error, Result};

/// Trial tier assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TierKind {
    /// Random split: `round(fraction * n)` trials train, the rest validate
    Random {
        /// Training fraction in `(0, 1]`
        fraction: f64,
        /// Shuffle seed
        seed: u64,
    },
}

impl LinkKind for TierKind {
    const TABLE: &'static str = "trialtier";

    fn type_tag(&self) -> &'static str {
        "random"
    }
}

impl TierKind {
    /// Split `trial_ids` into `(training, validation)`, both sorted.
    ///
    /// # Errors
    /// Returns `InvalidInput` for a fraction outside `(0, 1]`
    pub fn split(&self, trial_ids: &[String]) -> Result<(Vec<String>, Vec<String>)> {
        match self {
            Self::Random { fraction, seed } => split(trial_ids, *fraction, *seed),
        }
    }
}

/// Shuffle the sorted ids with ChaCha8 seeded by `seed` and cut at
/// `round(fraction * n)`. The same `(ids, fraction, seed)` always yields the
/// same split, regardless of the input order of `trial_ids`.
///
/// # Errors
/// Returns `InvalidInput` for a fraction outside `(0, 1]`
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn split(trial_ids: &[String], fraction: f64, seed: u64) -> Result<(Vec<String>, Vec<String>)> {
    positive("tier fraction", fraction)?;
    if fraction > 1.0 {
        return Err(Error::InvalidInput(format!(
            "tier fraction must be at most 1, got {fraction}"
        )));
    }

    let mut ids = trial_ids.to_vec();
    ids.sort();
    ids.dedup();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    ids.shuffle(&mut rng);

    let cut = ((ids.len() as f64) * fraction).round() as usize;
    let mut validation = ids.split_off(cut.min(ids.len()));
    let mut training = ids;
    training.sort();
    validation.sort();
    Ok((training, validation))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("trial-{i:03}")).collect()
    }

    #[test]
    fn test_split_is_deterministic_and_partitions() {
        let all = ids(50);
        let (train_a, val_a) = split(&all, 0.8, 7).unwrap();
        let mut reversed = all.clone();
        reversed.reverse();
        let (train_b, val_b) = split(&reversed, 0.8, 7).unwrap();

        assert_eq!(train_a, train_b);
        assert_eq!(val_a, val_b);
        assert_eq!(train_a.len(), 40);
        assert_eq!(val_a.len(), 10);
        assert!(train_a.iter().all(|t| !val_a.contains(t)));
    }

    #[test]
    fn test_seed_changes_split() {
        let all = ids(50);
        let (a, _) = split(&all, 0.5, 1).unwrap();
        let (b, _) = split(&all, 0.5, 2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_fraction() {
        assert!(split(&ids(3), 0.0, 0).is_err());
        assert!(split(&ids(3), 1.5, 0).is_err());
        let (train, val) = TierKind::Random { fraction: 1.0, seed: 0 }.split(&ids(3)).unwrap();
        assert_eq!((train.len(), val.len()), (3, 0));
    }
}
