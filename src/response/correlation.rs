//! Signal correlation between recorded and predicted responses

use ndarray::{concatenate, Array2, Axis};
use serde::{Deserialize, Serialize};
use trueno::Vector;

use super::{requests, visual_responses, VisualKey, VisualMeasure};
use crate::catalog::{Computed, Entity};
use crate::standardize::simd;
use crate::workspace::Workspace;
use crate::{Error, Result};

/// Pearson correlation over the positions where both inputs are finite.
///
/// NaN when fewer than two such positions exist or either side is constant.
///
/// # Errors
/// Returns `LengthMismatch` if the inputs differ in length
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn pearson(x: &[f32], y: &[f32]) -> Result<f64> {
    if x.len() != y.len() {
        return Err(Error::LengthMismatch {
            lengths: vec![x.len(), y.len()],
            tolerance: 0,
        });
    }
    let (xs, ys): (Vec<f64>, Vec<f64>) = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(&a, &b)| (f64::from(a), f64::from(b)))
        .unzip();
    if xs.len() < 2 {
        return Ok(f64::NAN);
    }
    let n = xs.len() as f64;
    let center = |v: &[f64]| -> Vec<f32> {
        let mean = v.iter().sum::<f64>() / n;
        v.iter().map(|a| (a - mean) as f32).collect()
    };
    let (xc, yc) = (center(&xs), center(&ys));
    let (xc, yc) = (Vector::from_slice(&xc), Vector::from_slice(&yc));
    let sxy = f64::from(simd(xc.dot(&yc))?);
    let sxx = f64::from(simd(xc.dot(&xc))?);
    let syy = f64::from(simd(yc.dot(&yc))?);
    if sxx <= 0.0 || syy <= 0.0 {
        return Ok(f64::NAN);
    }
    Ok((sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0))
}

/// Per-unit correlation of trial-averaged responses, normalized by CC-max
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualUnitCorrelation {
    /// Request
    pub key: VisualKey,
    /// Unit ids in readout order
    pub unit_ids: Vec<u32>,
    /// Correlation of the trial means
    pub cc_signal: Vec<f64>,
    /// CC-max of the recorded responses
    pub cc_max: Vec<f64>,
    /// `cc_signal / cc_max`
    pub cc_norm: Vec<f64>,
}

impl Entity for VisualUnitCorrelation {
    const TABLE: &'static str = "visual_unit_correlation";
    type Key = VisualKey;

    fn key(&self) -> VisualKey {
        self.key.clone()
    }
}

impl Computed for VisualUnitCorrelation {
    fn key_source(ws: &Workspace) -> Result<Vec<VisualKey>> {
        requests(ws)
    }

    fn make(ws: &Workspace, key: &VisualKey) -> Result<Self> {
        let measure = ws.fetch1::<VisualMeasure>(key)?;
        let (dataset, responses) = visual_responses(ws, key)?;

        let (predicted, recorded): (Vec<Array2<f32>>, Vec<Array2<f32>>) =
            responses.iter().map(|(_, r)| r.means()).unzip();
        let join = |blocks: &[Array2<f32>]| {
            let views: Vec<_> = blocks.iter().map(Array2::view).collect();
            concatenate(Axis(0), &views).map_err(|e| Error::InvalidInput(format!("response concatenation: {e}")))
        };
        let (predicted, recorded) = (join(&predicted)?, join(&recorded)?);

        let mut cc_signal = Vec::with_capacity(dataset.shape.units);
        for unit in 0..dataset.shape.units {
            let p = predicted.column(unit).to_vec();
            let r = recorded.column(unit).to_vec();
            cc_signal.push(pearson(&r, &p)?);
        }
        let cc_norm = cc_signal.iter().zip(&measure.cc_max).map(|(s, m)| s / m).collect();
        Ok(Self {
            key: key.clone(),
            unit_ids: dataset.unit_ids,
            cc_signal,
            cc_max: measure.cc_max,
            cc_norm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures;
    use super::*;

    #[test]
    fn test_pearson_skips_nans() {
        let x = [1.0, 2.0, f32::NAN, 4.0];
        let y = [2.0, 4.0, 100.0, 8.0];
        assert!((pearson(&x, &y).unwrap() - 1.0).abs() < 1e-6);
        let z = [4.0, 2.0, 0.0, -2.0];
        assert!((pearson(&x, &z).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_pearson_degenerate_inputs() {
        assert!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).unwrap().is_nan());
        assert!(pearson(&[1.0], &[1.0]).unwrap().is_nan());
        assert!(pearson(&[1.0, 2.0], &[1.0]).is_err());
    }

    #[test]
    fn test_perfect_prediction_correlates_fully() {
        let ws = Workspace::in_memory();
        let key = fixtures::scan(&ws, fixtures::directions(), 2);
        assert!(VisualUnitCorrelation::make(&ws, &key).unwrap_err().is_missing());

        ws.catalog().insert(VisualMeasure::make(&ws, &key).unwrap()).unwrap();
        let correlation = VisualUnitCorrelation::make(&ws, &key).unwrap();
        for cc in &correlation.cc_signal {
            assert!((cc - 1.0).abs() < 1e-5, "{cc}");
        }
        assert_eq!(correlation.cc_norm.len(), 2);
    }
}
