//! Trials and their per-rate caches

use serde::{Deserialize, Serialize};

use super::{RecordingKey, Video};
use crate::catalog::{content_id, Computed, Entity, Link};
use crate::params::RateKind;
use crate::resample::{check_monotonic, common_length, flip_index, samples};
use crate::workspace::Workspace;
use crate::{Error, Result};

/// One stimulus presentation: a video and the times its frames flipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    /// Content id of `(scan, trial_idx)`
    pub trial_id: String,
    /// Source scan
    pub scan: RecordingKey,
    /// Trial index within the scan
    pub trial_idx: u32,
    /// Frame flip times, one per video frame
    pub flips: Vec<f64>,
    /// Presented video
    pub video_id: String,
}

impl Entity for Trial {
    const TABLE: &'static str = "trial";
    type Key = String;

    fn key(&self) -> String {
        self.trial_id.clone()
    }
}

impl Trial {
    /// Insert a trial; flips must be finite, strictly increasing and
    /// one per frame of the (already inserted) video.
    ///
    /// # Errors
    /// Returns `MissingUpstream` for an unknown video, `InvalidInput` for
    /// malformed flips
    pub fn fill(
        ws: &Workspace,
        scan: RecordingKey,
        trial_idx: u32,
        flips: Vec<f64>,
        video_id: &str,
    ) -> Result<String> {
        let video = ws.fetch1::<Video>(&video_id.to_string())?;
        if flips.len() != video.frames {
            return Err(Error::InvalidInput(format!(
                "trial {scan}/{trial_idx} has {} flips for a {}-frame video",
                flips.len(),
                video.frames
            )));
        }
        check_monotonic(&flips)?;

        let trial_id = content_id(&("trial", &scan, trial_idx))?;
        ws.catalog().insert(Self {
            trial_id: trial_id.clone(),
            scan,
            trial_idx,
            flips,
            video_id: video_id.to_string(),
        })?;
        Ok(trial_id)
    }
}

/// First and last flip of a trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialBounds {
    /// Trial
    pub trial_id: String,
    /// First flip
    pub start: f64,
    /// Last flip
    pub end: f64,
}

impl Entity for TrialBounds {
    const TABLE: &'static str = "trial_bounds";
    type Key = String;

    fn key(&self) -> String {
        self.trial_id.clone()
    }
}

impl Computed for TrialBounds {
    fn key_source(ws: &Workspace) -> Result<Vec<String>> {
        Ok(ws.table::<Trial>()?.keys())
    }

    fn make(ws: &Workspace, key: &String) -> Result<Self> {
        let trial = ws.fetch1::<Trial>(key)?;
        check_monotonic(&trial.flips)?;
        let (Some(&start), Some(&end)) = (trial.flips.first(), trial.flips.last()) else {
            return Err(Error::InvalidInput(format!("trial {key} has no flips")));
        };
        Ok(Self {
            trial_id: key.clone(),
            start,
            end,
        })
    }
}

/// Key of the per-rate trial caches
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialRateKey {
    /// Trial
    pub trial_id: String,
    /// Rate link id
    pub rate_id: String,
}

fn trial_rate_keys(ws: &Workspace) -> Result<Vec<TrialRateKey>> {
    let rates = ws.table::<Link<RateKind>>()?.keys();
    Ok(ws
        .table::<TrialBounds>()?
        .keys()
        .into_iter()
        .flat_map(|trial_id| {
            rates.iter().map(move |rate_id| TrialRateKey {
                trial_id: trial_id.clone(),
                rate_id: rate_id.clone(),
            })
        })
        .collect())
}

/// Sample count of a trial at a rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSamples {
    /// Key
    pub key: TrialRateKey,
    /// `samples(start, end, period)`
    pub samples: usize,
}

impl Entity for TrialSamples {
    const TABLE: &'static str = "trial_samples";
    type Key = TrialRateKey;

    fn key(&self) -> TrialRateKey {
        self.key.clone()
    }
}

impl Computed for TrialSamples {
    fn key_source(ws: &Workspace) -> Result<Vec<TrialRateKey>> {
        trial_rate_keys(ws)
    }

    fn make(ws: &Workspace, key: &TrialRateKey) -> Result<Self> {
        let bounds = ws.fetch1::<TrialBounds>(&key.trial_id)?;
        let period = RateKind::resolve(ws, &key.rate_id)?;
        Ok(Self {
            key: key.clone(),
            samples: samples(bounds.start, bounds.end, period)?,
        })
    }
}

/// Video frame shown at each sample of a trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResampledTrial {
    /// Key
    pub key: TrialRateKey,
    /// Frame index per sample, length `samples`
    pub index: Vec<usize>,
}

impl Entity for ResampledTrial {
    const TABLE: &'static str = "resampled_trial";
    type Key = TrialRateKey;

    fn key(&self) -> TrialRateKey {
        self.key.clone()
    }
}

impl Computed for ResampledTrial {
    fn key_source(ws: &Workspace) -> Result<Vec<TrialRateKey>> {
        trial_rate_keys(ws)
    }

    fn make(ws: &Workspace, key: &TrialRateKey) -> Result<Self> {
        let trial = ws.fetch1::<Trial>(&key.trial_id)?;
        let bounds = ws.fetch1::<TrialBounds>(&key.trial_id)?;
        let period = RateKind::resolve(ws, &key.rate_id)?;
        let count = samples(bounds.start, bounds.end, period)?;

        let flips: Vec<f64> = trial.flips.iter().map(|t| t - bounds.start).collect();
        let mut index = flip_index(&flips, period)?;
        // one-decimal snapping may add a trailing sample
        let length = common_length(&[index.len(), count], 1)?;
        index.truncate(length);
        if index.len() != count {
            return Err(Error::LengthMismatch {
                lengths: vec![index.len(), count],
                tolerance: 0,
            });
        }
        Ok(Self {
            key: key.clone(),
            index,
        })
    }
}
