//! Reliability of recorded responses

use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::{requests, visual_responses, TrialResponses, VisualKey};
use crate::catalog::{Computed, Entity};
use crate::recording::Video;
use crate::workspace::Workspace;
use crate::{Error, Result};

fn nanvar(values: impl Iterator<Item = f64>) -> Option<f64> {
    let finite: Vec<f64> = values.filter(|v| v.is_finite()).collect();
    if finite.len() < 2 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    Some(finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0))
}

/// Upper bound on the correlation any model can reach with the trial
/// average of `x` (`[trials, samples]`, NaN where a trial is absent).
///
/// With `t` the finite trial count per sample, `P` the variance of the
/// trial mean and `TP` the mean per-trial variance, the effective trial
/// count is `n = Σ(t-1) / Σ((t-1)/t)` and the signal power
/// `SP = (n·P - TP) / (n - 1)`. Returns `sqrt(SP / P)` clamped to `[0, 1]`,
/// or NaN when fewer than two samples carry repeated trials.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn cc_max(x: ArrayView2<'_, f32>) -> f64 {
    let mut means = Vec::with_capacity(x.ncols());
    let (mut repeats, mut weights) = (0.0, 0.0);
    for column in x.columns() {
        let finite: Vec<f64> = column.iter().map(|&v| f64::from(v)).filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            continue;
        }
        let t = finite.len() as f64;
        means.push(finite.iter().sum::<f64>() / t);
        repeats += t - 1.0;
        weights += (t - 1.0) / t;
    }

    let Some(p) = nanvar(means.into_iter()) else {
        return f64::NAN;
    };
    if weights <= 0.0 {
        return f64::NAN;
    }
    let n = repeats / weights;
    let trial_vars: Vec<f64> = x
        .rows()
        .into_iter()
        .filter_map(|row| nanvar(row.iter().map(|&v| f64::from(v))))
        .collect();
    if p <= 0.0 || n <= 1.0 || trial_vars.is_empty() {
        return f64::NAN;
    }
    let tp = trial_vars.iter().sum::<f64>() / trial_vars.len() as f64;
    let sp = (n * p - tp) / (n - 1.0);
    (sp / p).max(0.0).sqrt().min(1.0)
}

/// Recorded `[trials, samples]` responses of one unit over every video,
/// trials padded with NaN to the largest trial count.
pub(crate) fn unit_trials(responses: &[(Video, TrialResponses)], unit: usize) -> Result<Array2<f32>> {
    let trials = responses
        .iter()
        .map(|(_, r)| r.recorded.len_of(Axis(0)))
        .max()
        .unwrap_or(0);
    let blocks: Vec<Array2<f32>> = responses
        .iter()
        .map(|(_, r)| {
            let samples = r.recorded.len_of(Axis(1));
            let mut block = Array2::from_elem((trials, samples), f32::NAN);
            let present = r.recorded.len_of(Axis(0));
            block
                .slice_mut(s![..present, ..])
                .assign(&r.recorded.slice(s![.., .., unit]));
            block
        })
        .collect();
    let views: Vec<_> = blocks.iter().map(Array2::view).collect();
    concatenate(Axis(1), &views).map_err(|e| Error::InvalidInput(format!("trial concatenation: {e}")))
}

/// CC-max of every unit of a model's dataset under a response request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualMeasure {
    /// Request
    pub key: VisualKey,
    /// Unit ids in readout order
    pub unit_ids: Vec<u32>,
    /// Per-unit CC-max, NaN where undefined
    pub cc_max: Vec<f64>,
}

impl Entity for VisualMeasure {
    const TABLE: &'static str = "visual_measure";
    type Key = VisualKey;

    fn key(&self) -> VisualKey {
        self.key.clone()
    }
}

impl Computed for VisualMeasure {
    fn key_source(ws: &Workspace) -> Result<Vec<VisualKey>> {
        requests(ws)
    }

    fn make(ws: &Workspace, key: &VisualKey) -> Result<Self> {
        let (dataset, responses) = visual_responses(ws, key)?;
        let cc_max = (0..dataset.shape.units)
            .map(|unit| Ok(cc_max(unit_trials(&responses, unit)?.view())))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(model = %key.model, units = cc_max.len(), "cc-max measured");
        Ok(Self {
            key: key.clone(),
            unit_ids: dataset.unit_ids,
            cc_max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_identical_trials_reach_one() {
        let x = array![[1.0f32, 2.0, 3.0, 4.0], [1.0, 2.0, 3.0, 4.0], [1.0, 2.0, 3.0, 4.0]];
        assert!((cc_max(x.view()) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_trial_stays_in_range() {
        let x = array![[1.0f32, 2.0, 3.0, 4.0], [1.0, 2.0, 3.0, 4.0], [1.0, 2.0, 3.0, f32::NAN]];
        let cc = cc_max(x.view());
        assert!(cc.is_finite());
        assert!((0.0..=1.0).contains(&cc));
    }

    #[test]
    fn test_noisy_trials_fall_below_one() {
        let x = array![[1.0f32, 2.0, 3.0, 4.0], [2.0, 1.0, 4.0, 3.0], [1.5, 2.5, 2.5, 3.5]];
        let cc = cc_max(x.view());
        assert!(cc > 0.0 && cc < 1.0, "{cc}");
    }

    #[test]
    fn test_single_trial_is_undefined() {
        let x = array![[1.0f32, 2.0, 3.0]];
        assert!(cc_max(x.view()).is_nan());
    }

    #[test]
    fn test_measure_of_repeated_presentations() {
        let ws = Workspace::in_memory();
        let key = super::super::fixtures::scan(&ws, super::super::fixtures::directions(), 3);
        let measure = VisualMeasure::make(&ws, &key).unwrap();
        assert_eq!(measure.unit_ids, vec![7, 9]);
        for cc in measure.cc_max {
            assert!((cc - 1.0).abs() < 1e-6 || cc.is_nan());
        }
    }
}
