//! Spatial tuning from spot stimuli

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::direction::box_impulse;
use super::{requests_presenting, sample_period, visual_responses, VisualKey};
use crate::catalog::{Computed, Entity};
use crate::recording::{SpotEvent, Stimulus};
use crate::workspace::Workspace;
use crate::{Error, Result};

/// Binary `[height, width]` mask of the pixels whose centers lie inside
/// the spot. Spot coordinates are fractions of the frame; the radius is a
/// fraction of the height.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn spot_mask(height: usize, width: usize, spot: &SpotEvent) -> Array2<f64> {
    let (h, w) = (height as f64, width as f64);
    let (cy, cx, r) = (spot.y * h, spot.x * w, spot.radius * h);
    Array2::from_shape_fn((height, width), |(i, j)| {
        let dy = i as f64 + 0.5 - cy;
        let dx = j as f64 + 0.5 - cx;
        if dy * dy + dx * dx <= r * r {
            1.0
        } else {
            0.0
        }
    })
}

/// Center, covariance and selectivity of a spatial response map
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialFit {
    /// Weighted mean row
    pub center_y: f64,
    /// Weighted mean column
    pub center_x: f64,
    /// `[[yy, yx], [xy, xx]]` weighted covariance in pixels²
    pub covariance: [[f64; 2]; 2],
    /// `-ln det(covariance)`, NaN when the covariance is singular
    pub ssi: f64,
}

/// Fit the positive part of `sta`, normalized to a distribution.
///
/// NaN pixels are ignored. All fields are NaN when no pixel is positive.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn spatial_selectivity(sta: &Array2<f64>) -> SpatialFit {
    let weights = sta.mapv(|v| if v.is_finite() { v.max(0.0) } else { 0.0 });
    let total = weights.sum();
    if total <= 0.0 {
        return SpatialFit {
            center_y: f64::NAN,
            center_x: f64::NAN,
            covariance: [[f64::NAN; 2]; 2],
            ssi: f64::NAN,
        };
    }
    let moment = |f: &dyn Fn(f64, f64) -> f64| -> f64 {
        weights
            .indexed_iter()
            .map(|((i, j), &p)| p * f(i as f64, j as f64))
            .sum::<f64>()
            / total
    };
    let cy = moment(&|y, _| y);
    let cx = moment(&|_, x| x);
    let yy = moment(&|y, _| (y - cy).powi(2));
    let xx = moment(&|_, x| (x - cx).powi(2));
    let yx = moment(&|y, x| (y - cy) * (x - cx));
    let det = yy * xx - yx * yx;
    SpatialFit {
        center_y: cy,
        center_x: cx,
        covariance: [[yy, yx], [yx, xx]],
        ssi: if det > 0.0 { -det.ln() } else { f64::NAN },
    }
}

/// Spike-triggered averages over spot stimuli for every unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualSpatialTuning {
    /// Request
    pub key: VisualKey,
    /// Unit ids in readout order
    pub unit_ids: Vec<u32>,
    /// Grid height
    pub height: usize,
    /// Grid width
    pub width: usize,
    /// `[unit]` row-major `[height, width]` STA, NaN where no spot covered
    pub sta: Vec<Vec<f64>>,
    /// Per-unit fit
    pub fits: Vec<SpatialFit>,
}

impl Entity for VisualSpatialTuning {
    const TABLE: &'static str = "visual_spatial_tuning";
    type Key = VisualKey;

    fn key(&self) -> VisualKey {
        self.key.clone()
    }
}

impl Computed for VisualSpatialTuning {
    fn key_source(ws: &Workspace) -> Result<Vec<VisualKey>> {
        requests_presenting(ws, |stimulus| matches!(stimulus, Stimulus::Spot(_)))
    }

    fn make(ws: &Workspace, key: &VisualKey) -> Result<Self> {
        let (dataset, responses) = visual_responses(ws, key)?;
        let period = sample_period(ws, &dataset.data_id)?;
        let (height, width, units) = (dataset.shape.height, dataset.shape.width, dataset.shape.units);

        let mut density = Array2::<f64>::zeros((height, width));
        let mut weighted = vec![Array2::<f64>::zeros((height, width)); units];
        let mut spots = 0;
        for (video, trials) in &responses {
            let Some(Stimulus::Spot(events)) = &video.stimulus else {
                continue;
            };
            let (predicted, _) = trials.means();
            let columns: Vec<Vec<f32>> = (0..units).map(|u| predicted.column(u).to_vec()).collect();
            for event in events {
                let mask = spot_mask(height, width, event);
                density += &mask;
                for (sum, response) in weighted.iter_mut().zip(&columns) {
                    let r = box_impulse(response, event.onset, event.offset, period, key.burnin);
                    if r.is_finite() {
                        sum.scaled_add(r, &mask);
                    }
                }
                spots += 1;
            }
        }
        if spots == 0 {
            return Err(Error::InvalidInput(format!(
                "video set {} has no spot stimuli",
                key.videoset_id
            )));
        }

        let mut sta = Vec::with_capacity(units);
        let mut fits = Vec::with_capacity(units);
        for sum in weighted {
            let mut map = sum;
            map.zip_mut_with(&density, |v, &d| *v = if d > 0.0 { *v / d } else { f64::NAN });
            fits.push(spatial_selectivity(&map));
            sta.push(map.iter().copied().collect());
        }
        tracing::info!(model = %key.model, spots, "spatial tuning fitted");
        Ok(Self {
            key: key.clone(),
            unit_ids: dataset.unit_ids,
            height,
            width,
            sta,
            fits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures;
    use super::*;
    use ndarray::array;

    fn spot(y: f64, x: f64, radius: f64) -> SpotEvent {
        SpotEvent {
            onset: 0.0,
            offset: 0.1,
            y,
            x,
            radius,
        }
    }

    #[test]
    fn test_spot_mask_covers_center() {
        let mask = spot_mask(4, 4, &spot(0.5, 0.5, 0.25));
        assert_eq!(mask.sum(), 4.0);
        assert_eq!(mask[[1, 1]], 1.0);
        assert_eq!(mask[[0, 0]], 0.0);
        assert_eq!(spot_mask(4, 4, &spot(0.5, 0.5, 1.0)).sum(), 16.0);
    }

    #[test]
    fn test_concentrated_map_is_more_selective() {
        let broad = array![[1.0, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, 1.0]];
        let narrow = array![[0.1, 0.1, 0.1], [0.1, 1.0, 0.1], [0.1, 0.1, 0.1]];
        let broad = spatial_selectivity(&broad);
        let narrow = spatial_selectivity(&narrow);
        assert!((broad.center_y - 1.0).abs() < 1e-12 && (narrow.center_x - 1.0).abs() < 1e-12);
        assert!(narrow.ssi > broad.ssi);
        assert!(broad.covariance[0][1].abs() < 1e-12);
    }

    #[test]
    fn test_negative_map_is_undefined() {
        let fit = spatial_selectivity(&array![[-1.0, f64::NAN], [-2.0, -3.0]]);
        assert!(fit.ssi.is_nan() && fit.center_y.is_nan());
    }

    #[test]
    fn test_tuning_over_quadrant_spots() {
        let ws = Workspace::in_memory();
        let key = fixtures::scan(&ws, fixtures::spots(), 2);
        let tuning = VisualSpatialTuning::make(&ws, &key).unwrap();
        assert_eq!((tuning.height, tuning.width), (2, 2));
        assert_eq!(tuning.sta.len(), 2);
        // every pixel is covered by exactly one spot
        assert!(tuning.sta.iter().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn test_direction_videos_have_no_spots() {
        let ws = Workspace::in_memory();
        let key = fixtures::scan(&ws, fixtures::directions(), 1);
        assert!(matches!(VisualSpatialTuning::make(&ws, &key), Err(Error::InvalidInput(_))));
    }
}
