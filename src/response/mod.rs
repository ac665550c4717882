//! Visual responses of trained models
//!
//! ## Schema Overview
//!
//! ```text
//! VisualRequest (model, videoset, trialfilterset, burnin, recorded channels)
//!   ├── VisualMeasure           CC-max of the recorded responses
//!   │     └── VisualUnitCorrelation   signal correlation, CC-max normalized
//!   ├── VisualDirectionTuning   bi-von-Mises fit, OSI, DSI
//!   └── VisualSpatialTuning     spike-triggered average over spots, SSI
//! ```
//!
//! Responses are generated per video: the trials of the video that pass
//! every trial filter, in recording order, are streamed through the model.

mod correlation;
mod direction;
mod measure;
mod spatial;

pub use correlation::{pearson, VisualUnitCorrelation};
pub use direction::{
    box_impulse, direction_indices, fit_bivonmises, BiVonMises, DirectionFit, VisualDirectionTuning,
};
pub use measure::{cc_max, VisualMeasure};
pub use spatial::{spatial_selectivity, spot_mask, SpatialFit, VisualSpatialTuning};

use ndarray::{s, Array2, Array3, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::{Entity, Link};
use crate::dataset::{Channel, Dataset, DatasetTrial, Spec, VisualScan};
use crate::network::{Inputs, Network, NetworkKind};
use crate::params::{RateKind, TrialFilterKind, TrialFilterSet, TrialSet, VideoSet};
use crate::progress::ModelKey;
use crate::recording::{Stimulus, Trial, Video};
use crate::resample::common_length;
use crate::train::model_parameters;
use crate::workspace::Workspace;
use crate::{Error, Result};

impl TrialFilterKind {
    /// Whether `trial` passes the filter.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if a referenced trial set is unknown
    pub fn accepts(&self, ws: &Workspace, trial: &Trial) -> Result<bool> {
        match self {
            Self::All => Ok(true),
            Self::Member { trialset_id } => TrialSet::contains(ws.catalog(), trialset_id, &trial.trial_id),
            Self::Duration { min, max } => {
                let duration = match (trial.flips.first(), trial.flips.last()) {
                    (Some(first), Some(last)) => last - first,
                    _ => return Ok(false),
                };
                Ok((*min..=*max).contains(&duration))
            }
        }
    }
}

/// Identity of one response computation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VisualKey {
    /// Trained model
    pub model: ModelKey,
    /// Videos to present
    pub videoset_id: String,
    /// Filters every selected trial must pass
    pub trialfilterset_id: String,
    /// Leading samples discarded per video
    pub burnin: usize,
    /// Feed recorded perspective traces instead of zeros
    pub recorded_perspective: bool,
    /// Feed recorded modulation traces instead of zeros
    pub recorded_modulation: bool,
}

/// Requested response computation; the key source of the visual tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualRequest {
    /// Key
    pub key: VisualKey,
}

impl Entity for VisualRequest {
    const TABLE: &'static str = "visual_request";
    type Key = VisualKey;

    fn key(&self) -> VisualKey {
        self.key.clone()
    }
}

/// Requested keys, for `key_source` of the visual tables.
pub(crate) fn requests(ws: &Workspace) -> Result<Vec<VisualKey>> {
    Ok(ws.table::<VisualRequest>()?.keys())
}

/// Requested keys whose video set presents at least one stimulus accepted
/// by `presents`. Keys with unresolved video sets are left out.
pub(crate) fn requests_presenting(ws: &Workspace, presents: fn(&Stimulus) -> bool) -> Result<Vec<VisualKey>> {
    let mut keys = Vec::new();
    for key in requests(ws)? {
        let videos = match VideoSet::members(ws.catalog(), &key.videoset_id) {
            Ok(videos) => videos,
            Err(e) if e.is_missing() => continue,
            Err(e) => return Err(e),
        };
        for video_id in &videos {
            let video = match ws.fetch1::<Video>(video_id) {
                Ok(video) => video,
                Err(e) if e.is_missing() => continue,
                Err(e) => return Err(e),
            };
            if video.stimulus.as_ref().is_some_and(presents) {
                keys.push(key);
                break;
            }
        }
    }
    Ok(keys)
}

/// Predicted and recorded responses of one video
#[derive(Debug, Clone, PartialEq)]
pub struct TrialResponses {
    /// Video
    pub video_id: String,
    /// Trials in recording order
    pub trial_ids: Vec<String>,
    /// `[trials, samples, units]` model output
    pub predicted: Array3<f32>,
    /// `[trials, samples, units]` recorded (standardized) responses
    pub recorded: Array3<f32>,
}

impl TrialResponses {
    /// Drop the first `burnin` samples.
    #[must_use]
    pub fn without_burnin(&self, burnin: usize) -> Self {
        let start = burnin.min(self.predicted.len_of(Axis(1)));
        Self {
            video_id: self.video_id.clone(),
            trial_ids: self.trial_ids.clone(),
            predicted: self.predicted.slice(s![.., start.., ..]).to_owned(),
            recorded: self.recorded.slice(s![.., start.., ..]).to_owned(),
        }
    }

    /// Trial-averaged `[samples, units]` arrays `(predicted, recorded)`,
    /// ignoring NaNs.
    #[must_use]
    pub fn means(&self) -> (Array2<f32>, Array2<f32>) {
        (nanmean_trials(&self.predicted), nanmean_trials(&self.recorded))
    }
}

#[allow(clippy::cast_precision_loss)]
fn nanmean_trials(x: &Array3<f32>) -> Array2<f32> {
    let (_, samples, units) = x.dim();
    Array2::from_shape_fn((samples, units), |(s, u)| {
        let (sum, count) = x
            .slice(s![.., s, u])
            .iter()
            .filter(|v| v.is_finite())
            .fold((0.0f64, 0usize), |(sum, n), &v| (sum + f64::from(v), n + 1));
        if count == 0 {
            f32::NAN
        } else {
            (sum / count as f64) as f32
        }
    })
}

/// Sampling period of a dataset's responses.
///
/// # Errors
/// Returns `MissingUpstream` if the scan, spec or rate is unknown
pub(crate) fn sample_period(ws: &Workspace, data_id: &str) -> Result<f64> {
    let scan = ws.fetch1::<VisualScan>(&data_id.to_string())?;
    let spec = ws.fetch1::<Spec>(&scan.spec_id)?;
    RateKind::resolve(ws, &spec.rate_id)
}

/// Network of a trained model with its final parameters.
///
/// # Errors
/// Returns `MissingUpstream` if the model or its dataset is not populated
pub fn load_network(ws: &Workspace, model: &ModelKey) -> Result<(Box<dyn Network>, Dataset)> {
    let dataset = ws.fetch1::<Dataset>(&model.data_id)?;
    let kind = Link::<NetworkKind>::get(ws.catalog(), &model.network_id)?;
    let mut network = kind.build(dataset.shape, &mut ChaCha8Rng::seed_from_u64(0))?;
    network.parameters_mut().load(&model_parameters(ws, model)?)?;
    Ok((network, dataset))
}

fn trial_inputs(
    ws: &Workspace,
    trial: &DatasetTrial,
    recorded_perspective: bool,
    recorded_modulation: bool,
) -> Result<Inputs> {
    let stimuli = trial.stimuli(ws)?;
    let samples = stimuli.len_of(Axis(0));
    let channel = |recorded: bool, channel: Channel| -> Result<Array2<f32>> {
        let recorded_values = trial.channel(ws, channel)?;
        if recorded {
            Ok(recorded_values)
        } else {
            Ok(Array2::zeros((samples, recorded_values.ncols())))
        }
    };
    Inputs::new(
        &stimuli,
        channel(recorded_perspective, Channel::Perspective)?,
        channel(recorded_modulation, Channel::Modulation)?,
    )
}

/// Responses of a model to one video, over the trials passing the filters.
///
/// Trials must belong to the model's dataset; their sample counts may
/// differ by one and are truncated to the shortest.
///
/// # Errors
/// Returns `MissingUpstream` when no trial passes the filters
pub fn trial_responses(
    ws: &Workspace,
    network: &dyn Network,
    dataset: &Dataset,
    video_id: &str,
    filters: &[TrialFilterKind],
    recorded_perspective: bool,
    recorded_modulation: bool,
) -> Result<TrialResponses> {
    let mut trials = Vec::new();
    for row in &dataset.trials {
        let trial = ws.fetch1::<Trial>(&row.trial_id)?;
        if trial.video_id != video_id {
            continue;
        }
        let mut accepted = true;
        for filter in filters {
            if !filter.accepts(ws, &trial)? {
                accepted = false;
                break;
            }
        }
        if accepted {
            trials.push((trial, row));
        }
    }
    if trials.is_empty() {
        return Err(Error::MissingUpstream(format!(
            "no trials of video {video_id} pass the filters in dataset {}",
            dataset.data_id
        )));
    }
    trials.sort_by_key(|(trial, _)| trial.trial_idx);

    let mut predicted = Vec::with_capacity(trials.len());
    let mut recorded = Vec::with_capacity(trials.len());
    for (_, row) in &trials {
        let inputs = trial_inputs(ws, row, recorded_perspective, recorded_modulation)?;
        predicted.push(network.forward(0, &inputs)?);
        recorded.push(row.channel(ws, Channel::Unit)?);
    }

    let lengths: Vec<usize> = predicted.iter().chain(&recorded).map(Array2::nrows).collect();
    let samples = common_length(&lengths, 1)?;
    let units = dataset.shape.units;
    let stack = |arrays: &[Array2<f32>]| -> Result<Array3<f32>> {
        let views: Vec<_> = arrays.iter().map(|a| a.slice(s![..samples, ..])).collect();
        ndarray::stack(Axis(0), &views).map_err(|e| Error::InvalidInput(format!("response stack: {e}")))
    };
    let predicted = stack(&predicted)?;
    let recorded = stack(&recorded)?;
    debug_assert_eq!(predicted.dim(), (trials.len(), samples, units));

    Ok(TrialResponses {
        video_id: video_id.to_string(),
        trial_ids: trials.into_iter().map(|(trial, _)| trial.trial_id).collect(),
        predicted,
        recorded,
    })
}

/// Responses to every video of the request's set, after burn-in.
///
/// Videos without accepted trials are skipped; if no video remains the
/// result is `MissingUpstream`.
///
/// # Errors
/// Returns `MissingUpstream` if the model, sets or trials are missing
pub fn visual_responses(ws: &Workspace, key: &VisualKey) -> Result<(Dataset, Vec<(Video, TrialResponses)>)> {
    let (network, dataset) = load_network(ws, &key.model)?;
    let filters = TrialFilterSet::members(ws.catalog(), &key.trialfilterset_id)?
        .iter()
        .map(|id| Link::<TrialFilterKind>::get(ws.catalog(), id))
        .collect::<Result<Vec<_>>>()?;

    let mut out = Vec::new();
    for video_id in VideoSet::members(ws.catalog(), &key.videoset_id)? {
        let video = ws.fetch1::<Video>(&video_id)?;
        match trial_responses(
            ws,
            network.as_ref(),
            &dataset,
            &video_id,
            &filters,
            key.recorded_perspective,
            key.recorded_modulation,
        ) {
            Ok(responses) => out.push((video, responses.without_burnin(key.burnin))),
            Err(e) if e.is_missing() => {
                tracing::debug!(video = %video_id, "no accepted trials");
            }
            Err(e) => return Err(e),
        }
    }
    if out.is_empty() {
        return Err(Error::MissingUpstream(format!(
            "no trials of video set {} pass filter set {}",
            key.videoset_id, key.trialfilterset_id
        )));
    }
    Ok((dataset, out))
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! A trained-model stand-in over a synthetic scan.

    use super::*;
    use crate::dataset::{ScanSelection, TraceSpec};
    use crate::network::{DataShape, StateDict};
    use crate::recording::{DirectionEvent, RecordingKey, SpotEvent, Stimulus, VideoTiming};
    use crate::train::Model;
    use ndarray::Array3;

    pub(crate) const PERIOD: f64 = 0.1;
    pub(crate) const FRAMES: usize = 12;

    /// Insert videos, trials, a dataset whose recorded units equal the
    /// model's predictions, and the model; returns a request key.
    pub(crate) fn scan(ws: &Workspace, stimuli: Vec<Stimulus>, trials_per_video: u32) -> VisualKey {
        let scan = RecordingKey::new(1, 1, 1);
        let shape = DataShape {
            height: 2,
            width: 2,
            perspectives: 1,
            modulations: 1,
            units: 2,
        };
        let network_id = Link::fill(
            ws.catalog(),
            NetworkKind::Linear {
                hidden: 2,
                streams: 1,
                init_scale: 1.0,
            },
        )
        .unwrap();
        let network = Link::<NetworkKind>::get(ws.catalog(), &network_id)
            .unwrap()
            .build(shape, &mut ChaCha8Rng::seed_from_u64(0))
            .unwrap();

        let mut video_ids = Vec::new();
        let mut rows = Vec::new();
        let mut trial_idx = 0;
        for (v, stimulus) in stimuli.into_iter().enumerate() {
            let frames = Array3::from_shape_fn((FRAMES, 2, 2), |(f, i, j)| {
                ((f * 31 + i * 17 + j * 7 + v * 50) % 256) as u8
            });
            let video_id = Video::fill(ws, &frames, VideoTiming::Period { period: PERIOD }, Some(stimulus)).unwrap();
            for _ in 0..trials_per_video {
                let flips: Vec<f64> = (0..FRAMES).map(|f| 100.0 * f64::from(trial_idx) + f as f64 * PERIOD).collect();
                let trial_id = Trial::fill(ws, scan.clone(), trial_idx, flips, &video_id).unwrap();
                let prefix = format!("datasets/fixture/{trial_id}");
                let perspectives = Array2::<f32>::zeros((FRAMES, 1));
                let modulations = Array2::<f32>::zeros((FRAMES, 1));
                let inputs = Inputs::new(&frames, perspectives.clone(), modulations.clone()).unwrap();
                let units = network.forward(0, &inputs).unwrap();
                crate::blob::put(ws.blobs(), &format!("{prefix}/stimuli.bin"), &frames).unwrap();
                crate::blob::put(ws.blobs(), &format!("{prefix}/perspectives.bin"), &perspectives).unwrap();
                crate::blob::put(ws.blobs(), &format!("{prefix}/modulations.bin"), &modulations).unwrap();
                crate::blob::put(ws.blobs(), &format!("{prefix}/units.bin"), &units).unwrap();
                rows.push(DatasetTrial {
                    trial_id,
                    training: true,
                    samples: FRAMES,
                    stimuli: format!("{prefix}/stimuli.bin"),
                    perspectives: format!("{prefix}/perspectives.bin"),
                    modulations: format!("{prefix}/modulations.bin"),
                    units: format!("{prefix}/units.bin"),
                });
                trial_idx += 1;
            }
            video_ids.push(video_id);
        }
        rows.sort_by(|a, b| a.trial_id.cmp(&b.trial_id));
        let rate_id = Link::fill(ws.catalog(), RateKind::Rate { period: PERIOD }).unwrap();
        let unused = || TraceSpec {
            offset_id: String::new(),
            resample_id: String::new(),
            standardize_id: String::new(),
        };
        let spec_id = Spec::fill(ws.catalog(), 2, 2, String::new(), rate_id, unused(), unused(), unused()).unwrap();
        ws.catalog()
            .insert(VisualScan {
                data_id: "fixture".to_string(),
                selection: ScanSelection {
                    scan: scan.clone(),
                    trialset_id: String::new(),
                    tier_id: String::new(),
                    perspectives_id: String::new(),
                    modulations_id: String::new(),
                    units_id: String::new(),
                },
                spec_id,
                training_trialset_id: String::new(),
                validation_trialset_id: None,
            })
            .unwrap();
        ws.catalog()
            .insert(Dataset {
                data_id: "fixture".to_string(),
                shape,
                unit_ids: vec![7, 9],
                trials: rows,
            })
            .unwrap();

        let model = ModelKey::new("fixture", network_id, "instance");
        let parameters: StateDict = network.parameters().clone();
        let parameters_key = "models/fixture/parameters.pt".to_string();
        ws.blobs().set(&parameters_key, parameters.to_bytes().unwrap()).unwrap();
        ws.catalog()
            .insert(Model {
                key: model.clone(),
                epochs: 1,
                parameters_key,
            })
            .unwrap();

        let filter = Link::fill(ws.catalog(), TrialFilterKind::All).unwrap();
        VisualKey {
            model,
            videoset_id: VideoSet::fill(ws.catalog(), video_ids).unwrap(),
            trialfilterset_id: TrialFilterSet::fill(ws.catalog(), [filter]).unwrap(),
            burnin: 2,
            recorded_perspective: false,
            recorded_modulation: false,
        }
    }

    pub(crate) fn directions() -> Vec<Stimulus> {
        (0..2)
            .map(|v| {
                Stimulus::Direction(
                    (0..4)
                        .map(|k| DirectionEvent {
                            onset: 0.3 * f64::from(k),
                            offset: 0.3 * f64::from(k) + 0.2,
                            direction: std::f64::consts::FRAC_PI_4 * f64::from(k + 4 * v),
                        })
                        .collect(),
                )
            })
            .collect()
    }

    pub(crate) fn spots() -> Vec<Stimulus> {
        vec![Stimulus::Spot(
            (0..4)
                .map(|k| SpotEvent {
                    onset: 0.3 * f64::from(k),
                    offset: 0.3 * f64::from(k) + 0.2,
                    y: 0.25 + 0.5 * f64::from(k / 2),
                    x: 0.25 + 0.5 * f64::from(k % 2),
                    radius: 0.3,
                })
                .collect(),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trial_responses_follow_recording_order() {
        let ws = Workspace::in_memory();
        let key = fixtures::scan(&ws, fixtures::directions(), 3);
        let (dataset, responses) = visual_responses(&ws, &key).unwrap();
        assert_eq!(dataset.data_id, "fixture");
        assert_eq!(responses.len(), 2);
        for (_, r) in &responses {
            assert_eq!(r.predicted.dim(), (3, fixtures::FRAMES - 2, 2));
            assert_eq!(r.predicted, r.recorded);
        }
    }

    #[test]
    fn test_empty_filter_is_missing_upstream() {
        let ws = Workspace::in_memory();
        let mut key = fixtures::scan(&ws, fixtures::directions(), 2);
        let none = Link::fill(ws.catalog(), TrialFilterKind::Duration { min: 50.0, max: 60.0 }).unwrap();
        key.trialfilterset_id = TrialFilterSet::fill(ws.catalog(), [none]).unwrap();
        assert!(visual_responses(&ws, &key).unwrap_err().is_missing());
    }

    #[test]
    fn test_duration_filter() {
        let ws = Workspace::in_memory();
        let key = fixtures::scan(&ws, fixtures::directions(), 1);
        let (_, responses) = visual_responses(&ws, &key).unwrap();
        let trial = ws.fetch1::<Trial>(&responses[0].1.trial_ids[0]).unwrap();
        let duration = trial.flips[trial.flips.len() - 1] - trial.flips[0];
        assert!(TrialFilterKind::Duration { min: duration - 0.01, max: duration + 0.01 }
            .accepts(&ws, &trial)
            .unwrap());
        assert!(!TrialFilterKind::Duration { min: 0.0, max: duration / 2.0 }
            .accepts(&ws, &trial)
            .unwrap());
    }
}
