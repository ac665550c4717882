//! Traces, their resampled caches and summaries

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::{RecordingKey, TrialBounds};
use crate::blob;
use crate::catalog::{content_id, Computed, Entity, Link};
use crate::dataset::{Channel, TraceSpec, VisualScan, Spec};
use crate::params::{OffsetKind, RateKind, ResampleKind, StandardizeKind, SummaryKind, TraceSet, TrialSet};
use crate::resample::{check_monotonic, fill_nans, Resampler};
use crate::standardize::Standardize;
use crate::workspace::Workspace;
use crate::{Error, Result};

/// What a trace measures
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TraceKind {
    /// Activity of one recorded unit
    Unit {
        /// Unit id within the scan
        unit_id: u32,
    },
    /// Eye position, pupil radius and similar
    Perspective {
        /// Signal name
        name: String,
    },
    /// Treadmill velocity, pupil dilation and similar
    Modulation {
        /// Signal name
        name: String,
    },
}

/// A time-stamped scalar signal. Samples live in the blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Content id of `(scan, kind)`
    pub trace_id: String,
    /// Source scan
    pub scan: RecordingKey,
    /// Signal kind
    pub kind: TraceKind,
    /// Standardization must not shift this trace
    pub homogeneous: bool,
    /// Trials this trace is valid for
    pub trialset_id: String,
    /// Sample count
    pub samples: usize,
    /// Blob key of `(times, values)`
    pub blob_key: String,
}

impl Entity for Trace {
    const TABLE: &'static str = "trace";
    type Key = String;

    fn key(&self) -> String {
        self.trace_id.clone()
    }
}

impl Trace {
    /// Store a trace and insert its row.
    ///
    /// `times` must be finite and strictly increasing; `values` may hold NaNs.
    ///
    /// # Errors
    /// Returns `InvalidInput` for malformed samples and `MissingUpstream`
    /// for an unknown trial set
    pub fn fill(
        ws: &Workspace,
        scan: RecordingKey,
        kind: TraceKind,
        times: Vec<f64>,
        values: Vec<f64>,
        homogeneous: bool,
        trialset_id: &str,
    ) -> Result<String> {
        if times.len() != values.len() || times.is_empty() {
            return Err(Error::InvalidInput(format!(
                "trace {kind:?} has {} times and {} values",
                times.len(),
                values.len()
            )));
        }
        check_monotonic(&times)?;
        ws.fetch1::<TrialSet>(&trialset_id.to_string())?;

        let trace_id = content_id(&("trace", &scan, &kind))?;
        let blob_key = format!("traces/{trace_id}.bin");
        let samples = times.len();
        blob::put(ws.blobs(), &blob_key, &(times, values))?;

        ws.catalog().insert(Self {
            trace_id: trace_id.clone(),
            scan,
            kind,
            homogeneous,
            trialset_id: trialset_id.to_string(),
            samples,
            blob_key,
        })?;
        Ok(trace_id)
    }

    /// Insert a trace set; every member must share one valid trial set.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the members disagree on their valid trials
    pub fn fill_set(ws: &Workspace, trace_ids: &[String]) -> Result<String> {
        let mut trialsets: Vec<String> = trace_ids
            .iter()
            .map(|id| Ok(ws.fetch1::<Self>(id)?.trialset_id))
            .collect::<Result<_>>()?;
        trialsets.sort();
        trialsets.dedup();
        if trialsets.len() > 1 {
            return Err(Error::InvalidInput(format!(
                "traces of one set must share valid trials, found {} trial sets",
                trialsets.len()
            )));
        }
        TraceSet::fill(ws.catalog(), trace_ids.iter().cloned())
    }

    /// Decode `(times, values)`.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if the blob is absent
    pub fn load(&self, ws: &Workspace) -> Result<(Vec<f64>, Vec<f64>)> {
        blob::fetch(ws.blobs(), &self.blob_key)
    }

    /// Fail unless `trial_id` is one of this trace's valid trials.
    ///
    /// # Errors
    /// Returns `InvalidTrial` for a trial outside the valid set
    pub fn check_trial(&self, ws: &Workspace, trial_id: &str) -> Result<()> {
        if TrialSet::contains(ws.catalog(), &self.trialset_id, trial_id)? {
            Ok(())
        } else {
            Err(Error::InvalidTrial(format!(
                "trial {trial_id} is not valid for trace {} ({:?})",
                self.trace_id, self.kind
            )))
        }
    }

    fn resampler(
        &self,
        ws: &Workspace,
        period: f64,
        offset_id: &str,
        resample_id: &str,
    ) -> Result<Box<dyn Resampler>> {
        let offset = Link::<OffsetKind>::get(ws.catalog(), offset_id)?.offset();
        let kind = Link::<ResampleKind>::get(ws.catalog(), resample_id)?;
        let (times, values) = self.load(ws)?;
        let values = fill_nans(&values)?;
        kind.resampler(&times, &values, period, offset)
    }
}

/// Resample one trace over one trial.
///
/// # Errors
/// Returns `InvalidTrial` if the trial is not valid for the trace,
/// `MissingUpstream` if bounds or parameters are missing
pub fn resampled_trace(
    ws: &Workspace,
    trace_id: &str,
    trial_id: &str,
    rate_id: &str,
    offset_id: &str,
    resample_id: &str,
) -> Result<Vec<f32>> {
    let trace = ws.fetch1::<Trace>(&trace_id.to_string())?;
    trace.check_trial(ws, trial_id)?;
    let bounds = ws.fetch1::<TrialBounds>(&trial_id.to_string())?;
    let period = RateKind::resolve(ws, rate_id)?;
    trace
        .resampler(ws, period, offset_id, resample_id)?
        .resample(bounds.start, bounds.end)
}

#[cfg(feature = "rayon")]
fn map_ordered<F>(workers: usize, count: usize, f: F) -> Result<Vec<Vec<f32>>>
where
    F: Fn(usize) -> Result<Vec<f32>> + Send + Sync,
{
    use rayon::prelude::*;

    if workers <= 1 {
        return (0..count).map(f).collect();
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| Error::Other(format!("failed to build worker pool: {e}")))?;
    pool.install(|| (0..count).into_par_iter().map(f).collect())
}

#[cfg(not(feature = "rayon"))]
fn map_ordered<F>(_workers: usize, count: usize, f: F) -> Result<Vec<Vec<f32>>>
where
    F: Fn(usize) -> Result<Vec<f32>> + Send + Sync,
{
    (0..count).map(f).collect()
}

/// Key of a resampled trace-set cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResampleKey {
    /// Trace set
    pub traceset_id: String,
    /// Trial
    pub trial_id: String,
    /// Rate link id
    pub rate_id: String,
    /// Offset link id
    pub offset_id: String,
    /// Resample link id
    pub resample_id: String,
}

/// `[samples, traces]` array of one trace set over one trial, columns in
/// `traceset_index` order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResampledTraces {
    /// Key
    pub key: ResampleKey,
    /// Rows
    pub samples: usize,
    /// Columns
    pub traces: usize,
    /// Blob key of the array
    pub blob_key: String,
}

impl Entity for ResampledTraces {
    const TABLE: &'static str = "resampled_traces";
    type Key = ResampleKey;

    fn key(&self) -> ResampleKey {
        self.key.clone()
    }
}

impl ResampledTraces {
    /// Decode the array.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if the blob is absent
    pub fn load(&self, ws: &Workspace) -> Result<Array2<f32>> {
        blob::fetch(ws.blobs(), &self.blob_key)
    }
}

fn data_channels(ws: &Workspace) -> Result<Vec<(VisualScan, Spec, Channel)>> {
    let mut out = Vec::new();
    for scan in ws.table::<VisualScan>()?.rows() {
        let spec = ws.fetch1::<Spec>(&scan.spec_id)?;
        for channel in Channel::ALL {
            out.push((scan.clone(), spec.clone(), channel));
        }
    }
    Ok(out)
}

impl Computed for ResampledTraces {
    fn key_source(ws: &Workspace) -> Result<Vec<ResampleKey>> {
        let mut keys = Vec::new();
        for (scan, spec, channel) in data_channels(ws)? {
            let trace_spec = spec.channel(channel);
            for trial_id in TrialSet::members(ws.catalog(), scan.trialset_id())? {
                keys.push(ResampleKey {
                    traceset_id: scan.traceset(channel).to_string(),
                    trial_id,
                    rate_id: spec.rate_id.clone(),
                    offset_id: trace_spec.offset_id.clone(),
                    resample_id: trace_spec.resample_id.clone(),
                });
            }
        }
        Ok(keys)
    }

    fn make(ws: &Workspace, key: &ResampleKey) -> Result<Self> {
        let traces: Vec<Trace> = TraceSet::members(ws.catalog(), &key.traceset_id)?
            .iter()
            .map(|id| ws.fetch1::<Trace>(id))
            .collect::<Result<_>>()?;
        for trace in &traces {
            trace.check_trial(ws, &key.trial_id)?;
        }
        let bounds = ws.fetch1::<TrialBounds>(&key.trial_id)?;
        let period = RateKind::resolve(ws, &key.rate_id)?;
        let count = crate::resample::samples(bounds.start, bounds.end, period)?;

        let columns = map_ordered(ws.settings().workers, traces.len(), |i| {
            traces[i]
                .resampler(ws, period, &key.offset_id, &key.resample_id)?
                .resample(bounds.start, bounds.end)
        })?;
        if let Some(column) = columns.iter().find(|c| c.len() != count) {
            return Err(Error::LengthMismatch {
                lengths: vec![column.len(), count],
                tolerance: 0,
            });
        }

        let array = Array2::from_shape_fn((count, columns.len()), |(s, t)| columns[t][s]);
        let blob_key = format!("resampled_traces/{}.bin", content_id(key)?);
        blob::put(ws.blobs(), &blob_key, &array)?;
        Ok(Self {
            key: key.clone(),
            samples: count,
            traces: columns.len(),
            blob_key,
        })
    }
}

/// Key of a trace summary
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SummaryKey {
    /// Trace
    pub trace_id: String,
    /// Trials the summary runs over
    pub trialset_id: String,
    /// Summary link id
    pub summary_id: String,
    /// Rate link id
    pub rate_id: String,
    /// Offset link id
    pub offset_id: String,
    /// Resample link id
    pub resample_id: String,
}

/// Summary of one trace resampled over a trial set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    /// Key
    pub key: SummaryKey,
    /// Reduced value
    pub value: f64,
}

impl Entity for TraceSummary {
    const TABLE: &'static str = "trace_summary";
    type Key = SummaryKey;

    fn key(&self) -> SummaryKey {
        self.key.clone()
    }
}

impl Computed for TraceSummary {
    fn key_source(ws: &Workspace) -> Result<Vec<SummaryKey>> {
        let mut keys = Vec::new();
        for (scan, spec, channel) in data_channels(ws)? {
            let trace_spec = spec.channel(channel);
            let standardize = Link::<StandardizeKind>::get(ws.catalog(), &trace_spec.standardize_id)?;
            for trace_id in TraceSet::members(ws.catalog(), scan.traceset(channel))? {
                for summary_id in standardize.summary_ids() {
                    keys.push(SummaryKey {
                        trace_id: trace_id.clone(),
                        trialset_id: scan.training_trialset_id.clone(),
                        summary_id: summary_id.to_string(),
                        rate_id: spec.rate_id.clone(),
                        offset_id: trace_spec.offset_id.clone(),
                        resample_id: trace_spec.resample_id.clone(),
                    });
                }
            }
        }
        Ok(keys)
    }

    fn make(ws: &Workspace, key: &SummaryKey) -> Result<Self> {
        let trace = ws.fetch1::<Trace>(&key.trace_id)?;
        let summary = Link::<SummaryKind>::get(ws.catalog(), &key.summary_id)?;
        let period = RateKind::resolve(ws, &key.rate_id)?;
        let trials = TrialSet::members(ws.catalog(), &key.trialset_id)?;

        let resampler = trace.resampler(ws, period, &key.offset_id, &key.resample_id)?;
        let mut values = Vec::new();
        for trial_id in &trials {
            trace.check_trial(ws, trial_id)?;
            let bounds = ws.fetch1::<TrialBounds>(trial_id)?;
            values.extend(resampler.resample(bounds.start, bounds.end)?);
        }
        Ok(Self {
            key: key.clone(),
            value: summary.reduce(&values)?,
        })
    }
}

/// Standardizer for one channel of a trace set, built from its summaries.
///
/// # Errors
/// Returns `MissingUpstream` if any summary has not been populated
pub fn channel_standardizer(
    ws: &Workspace,
    traceset_id: &str,
    trialset_id: &str,
    rate_id: &str,
    spec: &TraceSpec,
) -> Result<Box<dyn Standardize>> {
    let kind = Link::<StandardizeKind>::get(ws.catalog(), &spec.standardize_id)?;
    let traces: Vec<Trace> = TraceSet::members(ws.catalog(), traceset_id)?
        .iter()
        .map(|id| ws.fetch1::<Trace>(id))
        .collect::<Result<_>>()?;

    let summaries = kind
        .summary_ids()
        .into_iter()
        .map(|summary_id| {
            traces
                .iter()
                .map(|trace| {
                    let key = SummaryKey {
                        trace_id: trace.trace_id.clone(),
                        trialset_id: trialset_id.to_string(),
                        summary_id: summary_id.to_string(),
                        rate_id: rate_id.to_string(),
                        offset_id: spec.offset_id.clone(),
                        resample_id: spec.resample_id.clone(),
                    };
                    Ok(ws.fetch1::<TraceSummary>(&key)?.value)
                })
                .collect::<Result<Vec<f64>>>()
        })
        .collect::<Result<Vec<_>>>()?;
    let homogeneous: Vec<bool> = traces.iter().map(|t| t.homogeneous).collect();
    kind.build(&summaries, &homogeneous)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{populate, PopulateOptions};
    use crate::recording::{Trial, Video, VideoTiming};
    use ndarray::Array3;

    struct Fixture {
        ws: Workspace,
        trials: Vec<String>,
        trialset: String,
        rate: String,
        offset: String,
        resample: String,
    }

    fn fixture() -> Fixture {
        let ws = Workspace::in_memory();
        let scan = RecordingKey::new(1, 1, 1);
        let frames = Array3::<u8>::zeros((5, 2, 2));
        let video = Video::fill(&ws, &frames, VideoTiming::Period { period: 0.5 }, None).unwrap();
        let trials: Vec<String> = (0..2u32)
            .map(|i| {
                let start = f64::from(i) * 3.0;
                let flips = (0..5).map(|k| start + f64::from(k) * 0.5).collect();
                Trial::fill(&ws, scan.clone(), i, flips, &video).unwrap()
            })
            .collect();
        populate::<TrialBounds>(&ws, PopulateOptions::local()).unwrap();
        let trialset = TrialSet::fill(ws.catalog(), trials.clone()).unwrap();
        Fixture {
            rate: Link::fill(ws.catalog(), RateKind::Rate { period: 0.5 }).unwrap(),
            offset: Link::fill(ws.catalog(), OffsetKind::Constant { offset: 0.0 }).unwrap(),
            resample: Link::fill(ws.catalog(), ResampleKind::Hamming).unwrap(),
            ws,
            trials,
            trialset,
        }
    }

    fn ramp(f: &Fixture, unit_id: u32, slope: f64) -> String {
        let times: Vec<f64> = (0..=12).map(|k| f64::from(k) * 0.5).collect();
        let values = times.iter().map(|t| t * slope).collect();
        Trace::fill(
            &f.ws,
            RecordingKey::new(1, 1, 1),
            TraceKind::Unit { unit_id },
            times,
            values,
            false,
            &f.trialset,
        )
        .unwrap()
    }

    #[test]
    fn test_resampled_trace_over_trial() {
        let f = fixture();
        let trace = ramp(&f, 0, 2.0);
        let out = resampled_trace(&f.ws, &trace, &f.trials[1], &f.rate, &f.offset, &f.resample).unwrap();
        assert_eq!(out, vec![6.0f32, 7.0, 8.0, 9.0, 10.0]);
    }

    #[test]
    fn test_invalid_trial_rejected() {
        let f = fixture();
        let only_first = TrialSet::fill(f.ws.catalog(), [f.trials[0].clone()]).unwrap();
        let trace = Trace::fill(
            &f.ws,
            RecordingKey::new(1, 1, 1),
            TraceKind::Modulation { name: "treadmill".into() },
            vec![0.0, 1.0, 2.0],
            vec![0.0, 1.0, 2.0],
            true,
            &only_first,
        )
        .unwrap();
        let err = resampled_trace(&f.ws, &trace, &f.trials[1], &f.rate, &f.offset, &f.resample)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTrial(_)));
    }

    #[test]
    fn test_trace_set_requires_shared_trials() {
        let f = fixture();
        let a = ramp(&f, 0, 1.0);
        let only_first = TrialSet::fill(f.ws.catalog(), [f.trials[0].clone()]).unwrap();
        let b = Trace::fill(
            &f.ws,
            RecordingKey::new(1, 1, 1),
            TraceKind::Unit { unit_id: 9 },
            vec![0.0, 1.0],
            vec![0.0, 1.0],
            false,
            &only_first,
        )
        .unwrap();
        assert!(Trace::fill_set(&f.ws, &[a.clone(), b]).is_err());
        assert!(Trace::fill_set(&f.ws, &[a]).is_ok());
    }

    #[test]
    fn test_resampled_traces_stack_in_set_order() {
        let f = fixture();
        let a = ramp(&f, 0, 1.0);
        let b = ramp(&f, 1, -1.0);
        let set = Trace::fill_set(&f.ws, &[a.clone(), b.clone()]).unwrap();
        let order = TraceSet::members(f.ws.catalog(), &set).unwrap();

        let key = ResampleKey {
            traceset_id: set,
            trial_id: f.trials[0].clone(),
            rate_id: f.rate.clone(),
            offset_id: f.offset.clone(),
            resample_id: f.resample.clone(),
        };
        let row = ResampledTraces::make(&f.ws, &key).unwrap();
        let array = row.load(&f.ws).unwrap();
        assert_eq!(array.dim(), (5, 2));
        let slope_of = |id: &String| if *id == a { 1.0f32 } else { -1.0 };
        for (column, id) in order.iter().enumerate() {
            assert_eq!(array[[4, column]], 2.0 * slope_of(id));
        }
    }

    #[test]
    fn test_summary_and_standardizer() {
        let f = fixture();
        let a = ramp(&f, 0, 1.0);
        let set = Trace::fill_set(&f.ws, &[a.clone()]).unwrap();
        let mean = Link::fill(f.ws.catalog(), SummaryKind::Mean).unwrap();
        let std = Link::fill(f.ws.catalog(), SummaryKind::Std).unwrap();
        let standardize = Link::fill(
            f.ws.catalog(),
            StandardizeKind::Affine {
                shift_id: mean.clone(),
                scale_id: std.clone(),
                eps: 1e-6,
            },
        )
        .unwrap();

        for summary_id in [&mean, &std] {
            let key = SummaryKey {
                trace_id: a.clone(),
                trialset_id: f.trialset.clone(),
                summary_id: summary_id.clone(),
                rate_id: f.rate.clone(),
                offset_id: f.offset.clone(),
                resample_id: f.resample.clone(),
            };
            let row = TraceSummary::make(&f.ws, &key).unwrap();
            f.ws.catalog().insert(row).unwrap();
        }
        // trial 0 covers [0, 2], trial 1 covers [3, 5]
        let key_mean = SummaryKey {
            trace_id: a,
            trialset_id: f.trialset.clone(),
            summary_id: mean,
            rate_id: f.rate.clone(),
            offset_id: f.offset.clone(),
            resample_id: f.resample.clone(),
        };
        assert!((f.ws.fetch1::<TraceSummary>(&key_mean).unwrap().value - 2.5).abs() < 1e-6);

        let spec = TraceSpec {
            offset_id: f.offset.clone(),
            resample_id: f.resample.clone(),
            standardize_id: standardize,
        };
        let t = channel_standardizer(&f.ws, &set, &f.trialset, &f.rate, &spec).unwrap();
        assert_eq!(t.channels(), 1);
    }
}
