//! Recording model: videos, trials, traces and their resampled caches
//!
//! ## Schema Overview
//!
//! ```text
//! Video ──< ResizedVideo (video, resize, height, width)
//!   │
//! Trial (flips, video) ──< TrialBounds ──< TrialSamples (trial, rate)
//!   │                                  └──< ResampledTrial (trial, rate)
//! TrialSet ─┐
//!           └── Trace (times, values, homogeneous, valid trials)
//!                 ├──< ResampledTraces (traceset, trial, rate, offset, resample)
//!                 └──< TraceSummary (trace, trialset, summary, rate, offset, resample)
//! ```
//!
//! Rows above the resampled caches reflect external truth and are only
//! ever added; the caches are computed once per key by
//! [`populate`](crate::catalog::populate).

mod tier;
mod trace;
mod trial;
mod video;

pub use tier::{split, TierKind};
pub use trace::{
    channel_standardizer, resampled_trace, ResampleKey, ResampledTraces, SummaryKey, Trace,
    TraceKind, TraceSummary,
};
pub use trial::{ResampledTrial, Trial, TrialBounds, TrialRateKey, TrialSamples};
pub use video::{
    resize, DirectionEvent, ResizeKey, ResizedVideo, SpotEvent, Stimulus, Video, VideoMode,
    VideoTiming,
};

use serde::{Deserialize, Serialize};

/// Identifies one imaging scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordingKey {
    /// Animal
    pub animal_id: u32,
    /// Session within the animal
    pub session: u32,
    /// Scan within the session
    pub scan_idx: u32,
}

impl RecordingKey {
    /// Create a recording key.
    #[must_use]
    pub const fn new(animal_id: u32, session: u32, scan_idx: u32) -> Self {
        Self {
            animal_id,
            session,
            scan_idx,
        }
    }
}

impl std::fmt::Display for RecordingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.animal_id, self.session, self.scan_idx)
    }
}
